// Storage engine adapters.

pub mod memory;
