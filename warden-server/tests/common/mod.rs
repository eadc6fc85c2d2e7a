// Not every test binary exercises every harness piece.
#![allow(dead_code)]

mod harness;

pub use harness::*;
