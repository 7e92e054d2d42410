pub mod timeout_sweeper;
