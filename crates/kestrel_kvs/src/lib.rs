pub mod api;
pub mod memory;

pub use api::{
    next_lexicographic_name, CheckAndSetRequest, KeyValueService, KvsResult, RangeRequest,
    RowResult, StoredValue,
};
pub use memory::InMemoryKvs;
