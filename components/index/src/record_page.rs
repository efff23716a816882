//! Record pages hold a chapter's records sorted by name and laid out as an
//! implicit binary search tree: node `n` has children `2n + 1` and `2n + 2`.

use std::cmp::Ordering;

use dedupe_common::{BYTES_PER_RECORD, RECORD_NAME_SIZE};
use dedupe_types::record::{Record, RecordData, RecordName};

/// Fill `page` with `records` (exactly one page worth) in tree order.
pub fn encode_record_page(records: &[Record], page: &mut [u8]) {
    let mut sorted = records.to_vec();
    sorted.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    let mut next = 0;
    encode_tree(page, &sorted, &mut next, 0);
}

fn encode_tree(page: &mut [u8], sorted: &[Record], next: &mut usize, node: usize) {
    if node >= sorted.len() {
        return;
    }
    encode_tree(page, sorted, next, 2 * node + 1);
    let record = &sorted[*next];
    let at = node * BYTES_PER_RECORD;
    page[at..at + RECORD_NAME_SIZE].copy_from_slice(record.name.as_bytes());
    page[at + RECORD_NAME_SIZE..at + BYTES_PER_RECORD].copy_from_slice(&record.data.0);
    *next += 1;
    encode_tree(page, sorted, next, 2 * node + 2);
}

fn name_at(page: &[u8], node: usize) -> &[u8] {
    let at = node * BYTES_PER_RECORD;
    &page[at..at + RECORD_NAME_SIZE]
}

/// Walk the tree for `name`.
pub fn search_record_page(page: &[u8], name: &RecordName, records_per_page: u32) -> Option<RecordData> {
    let mut node = 0usize;
    while node < records_per_page as usize {
        match name.as_bytes()[..].cmp(name_at(page, node)) {
            Ordering::Equal => {
                let at = node * BYTES_PER_RECORD + RECORD_NAME_SIZE;
                return RecordData::from_slice(&page[at..at + BYTES_PER_RECORD - RECORD_NAME_SIZE]);
            }
            Ordering::Less => node = 2 * node + 1,
            Ordering::Greater => node = 2 * node + 2,
        }
    }
    None
}

/// Every record on the page, in node order.
pub fn decode_record_page(page: &[u8], records_per_page: u32) -> Vec<Record> {
    page.chunks_exact(BYTES_PER_RECORD)
        .take(records_per_page as usize)
        .filter_map(|chunk| {
            Some(Record::new(
                RecordName::from_slice(chunk)?,
                RecordData::from_slice(&chunk[RECORD_NAME_SIZE..])?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn records(count: usize) -> Vec<Record> {
        let mut rng = StdRng::seed_from_u64(9);
        (0..count)
            .map(|i| Record::new(RecordName::new(rng.gen()), RecordData::from_u64(i as u64)))
            .collect()
    }

    #[test]
    fn every_record_is_found() {
        for count in [1usize, 7, 8, 31, 128] {
            let records = records(count);
            let mut page = vec![0u8; count * BYTES_PER_RECORD];
            encode_record_page(&records, &mut page);
            for r in &records {
                assert_eq!(search_record_page(&page, &r.name, count as u32), Some(r.data));
            }
            assert_eq!(search_record_page(&page, &RecordName::new([0xab; 16]), count as u32), None);
        }
    }

    #[test]
    fn root_is_the_median() {
        let records = records(7);
        let mut page = vec![0u8; 7 * BYTES_PER_RECORD];
        encode_record_page(&records, &mut page);

        let mut sorted: Vec<_> = records.iter().map(|r| r.name).collect();
        sorted.sort();
        let decoded = decode_record_page(&page, 7);
        assert_eq!(decoded[0].name, sorted[3]);
        assert_eq!(decoded[1].name, sorted[1]);
        assert_eq!(decoded[2].name, sorted[5]);
        assert_eq!(decoded.len(), 7);
    }
}
