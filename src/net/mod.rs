pub mod bitstream;
pub mod protocol;
