//! Scenarios that drive the public APIs of the index and the slab depot
//! the way a block device would.

#[cfg(test)]
mod depot_scenarios;
#[cfg(test)]
mod index_scenarios;
