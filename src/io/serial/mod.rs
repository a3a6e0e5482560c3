// src/io/serial/mod.rs
//
// Line-oriented serial adapter for Arduino-style CAN bridges.
//
// Receive: ID_HEX,DLC_HEX[,BYTE_HEX]*DLC\n
// Send:    S:ID_HEX,DLC_HEX[,BYTE_HEX]*\n

pub mod codec;
mod reader;

pub use codec::SerialLineCodec;
pub use reader::SerialLineAdapter;
