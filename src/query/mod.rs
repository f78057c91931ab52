/// Client query cache reconciliation for optimistic list mutations
pub mod attachments;
pub mod cache;
pub mod data;

pub use attachments::{name_from_filename, Attachment};
pub use cache::{MutationContext, OptimisticOp, QueryCache, QueryItem, QueryKey};
pub use data::{format_updated_data, CachedQuery, InfiniteQueryData, QueryData};
