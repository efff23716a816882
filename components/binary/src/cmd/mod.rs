pub mod depot;
pub mod index;

use serde::Serialize;
use snafu::{ResultExt, Whatever};

pub(crate) const LOGGING_OPTIONS_HEADER: &str = "Logging options";

pub(crate) fn init_logging(level: &str) -> Result<(), Whatever> {
    dedupe_utils::logger::init_tracing_and_logging(dedupe_common::DEDUPE, level)
}

pub(crate) fn print_json(value: &impl Serialize) -> Result<(), Whatever> {
    let text = serde_json::to_string_pretty(value).whatever_context("failed to encode stats")?;
    println!("{text}");
    Ok(())
}
