//! Crate-wide test doubles and behaviour scenarios.

pub(crate) mod support;
