pub mod token_account;

pub use token_account::{DecodedTokenAccount, decode_token_account};
