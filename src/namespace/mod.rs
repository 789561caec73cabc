mod mapping;
mod proc;

pub use mapping::{map_to_container, map_to_host, IdMapping, MapOptions, UnmappedPolicy};
pub use proc::{current_uid_map, parse_id_map, running_in_user_namespace};
