//! Architecture support. The kernel targets 32-bit x86 only; the pure
//! parts (context layout, selector table, descriptor packing) also
//! compile on the host for the unit-test suite.

pub mod x86;
