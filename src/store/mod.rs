pub mod postgres;
pub mod traits;

pub use postgres::{PgMergeTxn, PostgresStore};
pub use traits::MergeStore;
