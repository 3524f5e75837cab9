pub mod ask;
pub mod chunk;
pub mod doctor;
pub mod memory;
pub mod onboard;
pub mod servers;
