pub mod ledger_client;

pub use ledger_client::RpcHistorySource;
