pub mod smarthost;
