#[allow(clippy::cast_possible_truncation)]
mod bitwise;

#[allow(clippy::missing_panics_doc)]
pub mod gif;

pub mod memory;

#[allow(clippy::missing_panics_doc)]
pub mod ring_buffer;

pub mod savestate;

#[allow(clippy::missing_panics_doc)]
#[allow(clippy::cast_possible_truncation)]
#[allow(clippy::unreadable_literal)]
pub mod vif;

pub mod vpu;
