/// User accounts and linked OAuth provider accounts
mod manager;

pub use manager::{AccountManager, NewUser};
