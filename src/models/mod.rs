pub mod account;
pub mod collection_run;
pub mod inbox_item;
pub mod platform;
