pub mod prefix;

pub use prefix::UidPrefixIndex;
