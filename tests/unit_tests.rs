//! Entry point for the unit test tree.

mod unit;
