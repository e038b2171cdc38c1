pub mod memory;
pub mod etcd;
pub mod types;

pub use memory::MemoryMetaStore;
pub use etcd::EtcdMetaStore;
pub use types::{MetaOp, MetaStore, MetaTxn, WatchEvent, WatchStream};
