// src/io/socketcan/reader.rs
//
// SocketCAN reader and sender. The socket is shared between the two halves;
// the kernel serialises concurrent read and write calls on one descriptor.

#[cfg(target_os = "linux")]
mod linux_impl {
    use socketcan::{
        CanDataFrame, CanFilter, CanFrame, CanRemoteFrame, CanSocket, EmbeddedFrame, ExtendedId,
        Id, Socket, SocketOptions, StandardId,
    };
    use std::sync::Arc;

    use crate::filter::MaskFilter;
    use crate::io::{
        now_secs, Frame, FrameSender, IoError, TransportAdapter, EXTENDED_ID_MAX, POLL_INTERVAL,
        SEND_TIMEOUT,
    };
    use crate::settings::ConnectionSettings;

    /// Extended frame format flag in a raw `can_id`
    const CAN_EFF_FLAG: u32 = 0x8000_0000;

    // ============================================================================
    // Interface Configuration
    // ============================================================================

    /// Kernel interface names: at most 15 of `[A-Za-z0-9_.-]`. The name is
    /// interpolated into a root shell command below.
    fn check_interface_name(interface: &str) -> Result<(), IoError> {
        let valid = !interface.is_empty()
            && interface.len() <= 15
            && interface
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(())
        } else {
            Err(IoError::configuration(format!(
                "invalid CAN interface name '{}'",
                interface
            )))
        }
    }

    /// Bring the interface down, set its bitrate and mode, and bring it back up,
    /// using pkexec for privilege escalation.
    fn configure_interface(interface: &str, bitrate: u32, listen_only: bool) -> Result<(), IoError> {
        use std::process::Command;

        check_interface_name(interface)?;

        let device = format!("socketcan({})", interface);
        tlog!(
            "[socketcan] Configuring {} with bitrate {}{} using pkexec",
            interface,
            bitrate,
            if listen_only { " (listen-only)" } else { "" }
        );

        let script = format!(
            "ip link set {iface} down && ip link set {iface} type can bitrate {bitrate} listen-only {lo} && ip link set {iface} up",
            iface = interface,
            bitrate = bitrate,
            lo = if listen_only { "on" } else { "off" },
        );

        let output = Command::new("pkexec")
            .args(["sh", "-c", &script])
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    IoError::configuration(
                        "pkexec not found. Install polkit or configure the interface manually.",
                    )
                } else {
                    IoError::connection(&device, format!("failed to run pkexec: {}", e))
                }
            })?;

        if output.status.success() {
            tlog!("[socketcan] Interface {} configured", interface);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("dismissed") || stderr.contains("cancelled") {
            Err(IoError::connection(&device, "authentication cancelled by user"))
        } else if stderr.contains("Not authorized") {
            Err(IoError::connection(&device, "not authorised to configure network interfaces"))
        } else {
            let detail = if stderr.trim().is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            };
            Err(IoError::connection(&device, format!("configure interface: {}", detail)))
        }
    }

    // ============================================================================
    // Frame Conversion
    // ============================================================================

    /// Convert a kernel frame to ours. Error frames are dropped.
    fn convert_frame(frame: CanFrame) -> Option<Frame> {
        let ts = now_secs();
        match frame {
            CanFrame::Data(f) => {
                let id = socketcan::Frame::raw_id(&f) & EXTENDED_ID_MAX;
                let extended = EmbeddedFrame::is_extended(&f);
                Frame::data(id, extended, EmbeddedFrame::data(&f), ts).ok()
            }
            CanFrame::Remote(f) => {
                let id = socketcan::Frame::raw_id(&f) & EXTENDED_ID_MAX;
                let extended = EmbeddedFrame::is_extended(&f);
                Frame::remote(id, extended, EmbeddedFrame::dlc(&f) as u8, ts).ok()
            }
            CanFrame::Error(_) => None,
        }
    }

    fn kernel_id(frame: &Frame) -> Result<Id, String> {
        if frame.is_extended() {
            ExtendedId::new(frame.id())
                .map(Id::Extended)
                .ok_or_else(|| format!("invalid extended ID: 0x{:08X}", frame.id()))
        } else {
            u16::try_from(frame.id())
                .ok()
                .and_then(StandardId::new)
                .map(Id::Standard)
                .ok_or_else(|| format!("invalid standard ID: 0x{:03X}", frame.id()))
        }
    }

    // ============================================================================
    // Adapter
    // ============================================================================

    pub struct SocketCanAdapter {
        device: String,
        socket: Option<Arc<CanSocket>>,
        hardware_filter: bool,
    }

    /// Open the interface named in `settings.channel`, optionally configuring
    /// the link first, and install the mask filter in the kernel.
    pub fn open(
        settings: &ConnectionSettings,
        mask: &MaskFilter,
    ) -> Result<Box<dyn TransportAdapter>, IoError> {
        let interface = settings.channel.as_str();
        let device = format!("socketcan({})", interface);

        if settings.configure_link {
            configure_interface(interface, settings.can_bitrate, settings.listen_only)?;
        }

        let socket = CanSocket::open(interface)
            .map_err(|e| IoError::connection(&device, e.to_string()))?;
        socket
            .set_read_timeout(POLL_INTERVAL)
            .map_err(|e| IoError::connection(&device, format!("set read timeout: {}", e)))?;
        socket
            .set_write_timeout(SEND_TIMEOUT)
            .map_err(|e| IoError::connection(&device, format!("set write timeout: {}", e)))?;

        if mask.enabled {
            let (code, mask_bits) = if mask.extended {
                (mask.code | CAN_EFF_FLAG, mask.mask | CAN_EFF_FLAG)
            } else {
                (mask.code, mask.mask | CAN_EFF_FLAG)
            };
            socket
                .set_filters(&[CanFilter::new(code, mask_bits)])
                .map_err(|e| IoError::connection(&device, format!("set filter: {}", e)))?;
            tlog!(
                "[socketcan] {} hardware filter code=0x{:X} mask=0x{:X}",
                device,
                mask.code,
                mask.mask
            );
        }

        tlog!("[socketcan] Opened {}", interface);

        Ok(Box::new(SocketCanAdapter {
            device,
            socket: Some(Arc::new(socket)),
            hardware_filter: mask.enabled,
        }))
    }

    impl TransportAdapter for SocketCanAdapter {
        fn device(&self) -> &str {
            &self.device
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, IoError> {
            let socket = self
                .socket
                .as_ref()
                .ok_or_else(|| IoError::read(&self.device, "socket closed"))?;
            match socket.read_frame() {
                Ok(frame) => Ok(convert_frame(frame)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
                Err(e) => Err(IoError::read(&self.device, e.to_string())),
            }
        }

        fn sender(&self) -> Result<Box<dyn FrameSender>, IoError> {
            let socket = self
                .socket
                .as_ref()
                .ok_or_else(|| IoError::connection(&self.device, "socket closed"))?;
            Ok(Box::new(SocketCanSender {
                device: self.device.clone(),
                socket: Arc::clone(socket),
            }))
        }

        fn supports_hardware_filter(&self) -> bool {
            self.hardware_filter
        }

        fn close(&mut self) {
            if self.socket.take().is_some() {
                tlog!("[socketcan] Closed {}", self.device);
            }
        }
    }

    // ============================================================================
    // Sender
    // ============================================================================

    struct SocketCanSender {
        device: String,
        socket: Arc<CanSocket>,
    }

    impl FrameSender for SocketCanSender {
        fn send_frame(&mut self, frame: &Frame) -> Result<(), IoError> {
            let id = kernel_id(frame).map_err(|e| IoError::send(&self.device, e))?;
            let result = if frame.is_remote() {
                let remote = CanRemoteFrame::new_remote(id, frame.dlc() as usize)
                    .ok_or_else(|| IoError::send(&self.device, "failed to build remote frame"))?;
                self.socket.write_frame(&remote)
            } else {
                let data = CanDataFrame::new(id, frame.payload())
                    .ok_or_else(|| IoError::send(&self.device, "failed to build data frame"))?;
                self.socket.write_frame(&data)
            };
            result.map_err(|e| IoError::send(&self.device, e.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_interface_name_checked_before_shell() {
            assert!(check_interface_name("can0").is_ok());
            assert!(check_interface_name("vcan_test-1.2").is_ok());
            for bad in ["", "can0; reboot", "can0 && id", "$(id)", "a/b", "averyveryverylong0"] {
                assert!(
                    matches!(check_interface_name(bad), Err(IoError::Configuration(_))),
                    "{:?} accepted",
                    bad
                );
            }
            assert!(matches!(
                configure_interface("can0`id`", 500_000, false),
                Err(IoError::Configuration(_))
            ));
        }

        #[test]
        fn test_kernel_id_widths() {
            let std_frame = Frame::data(0x123, false, &[], 0.0).unwrap();
            assert!(matches!(kernel_id(&std_frame), Ok(Id::Standard(_))));
            let ext_frame = Frame::data(0x18FF_0001, true, &[], 0.0).unwrap();
            assert!(matches!(kernel_id(&ext_frame), Ok(Id::Extended(_))));
        }

        #[test]
        fn test_convert_data_frame() {
            let id = StandardId::new(0x321).unwrap();
            let raw = CanDataFrame::new(id, &[1, 2, 3]).unwrap();
            let frame = convert_frame(CanFrame::Data(raw)).unwrap();
            assert_eq!(frame.id(), 0x321);
            assert!(!frame.is_extended());
            assert_eq!(frame.payload(), &[1, 2, 3]);
        }

        #[test]
        fn test_convert_remote_frame() {
            let id = ExtendedId::new(0x1ABC_DEF0).unwrap();
            let raw = CanRemoteFrame::new_remote(id, 4).unwrap();
            let frame = convert_frame(CanFrame::Remote(raw)).unwrap();
            assert_eq!(frame.id(), 0x1ABC_DEF0);
            assert!(frame.is_extended());
            assert!(frame.is_remote());
            assert_eq!(frame.dlc(), 4);
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::open;

// ============================================================================
// Non-Linux Stub
// ============================================================================

#[cfg(not(target_os = "linux"))]
pub fn open(
    settings: &crate::settings::ConnectionSettings,
    _mask: &crate::filter::MaskFilter,
) -> Result<Box<dyn crate::io::TransportAdapter>, crate::io::IoError> {
    Err(crate::io::IoError::configuration(format!(
        "SocketCAN ({}) is only available on Linux",
        settings.channel
    )))
}
