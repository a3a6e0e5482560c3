// src/io/socketcan/mod.rs
//
// SocketCAN adapter for Linux native CAN interfaces.
// Used with CANable Pro (Candlelight firmware), PEAK, or vcan for testing.
//
// The interface must be up before opening, either configured by the system:
//   sudo ip link set can0 up type can bitrate 500000
// or by us through pkexec when `configure_link` is set.
//
// On other platforms `open` fails with a configuration error.

mod reader;

pub use reader::open;
