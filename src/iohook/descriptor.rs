use std::fmt;

/// What kind of endpoint a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Usb,
    Serial,
    File,
}

/// Identity of the target of an open call, derived from its path.
///
/// Windows device interface paths embed the USB identity
/// (`\\?\usb#vid_0547&pid_2750#<serial>#{guid}`); serial ports are `COMn`
/// on Windows and `/dev/tty*` elsewhere. Everything else is a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial: Option<String>,
    pub capabilities: Vec<Capability>,
}

impl DeviceDescriptor {
    pub fn from_path(path: &str) -> Self {
        let normalized = normalize_path(path);
        let mut capabilities = Vec::new();

        let (vendor_id, product_id, serial) = match parse_usb_identity(&normalized) {
            Some((vid, pid, serial)) => {
                capabilities.push(Capability::Usb);
                (Some(vid), Some(pid), serial)
            }
            None => (None, None, None),
        };

        if is_serial_port(&normalized) {
            capabilities.push(Capability::Serial);
        }
        if capabilities.is_empty() {
            capabilities.push(Capability::File);
        }

        Self {
            path: path.to_string(),
            vendor_id,
            product_id,
            serial,
            capabilities,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn matches_usb(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == Some(vendor_id) && self.product_id == Some(product_id)
    }

    /// The path with device namespace prefixes removed, lowercased.
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }

    /// Compare against a configured alias such as `\\.\Ezusb-0` or `COM1`.
    pub fn path_is(&self, alias: &str) -> bool {
        !alias.is_empty() && self.normalized_path() == normalize_path(alias)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.vendor_id, self.product_id) {
            (Some(vid), Some(pid)) => write!(f, "{} [{:04x}:{:04x}]", self.path, vid, pid),
            _ => write!(f, "{}", self.path),
        }
    }
}

/// Strip `\\.\`, `\\?\` and `//./` prefixes and lowercase.
pub fn normalize_path(path: &str) -> String {
    let lower = path.to_ascii_lowercase();
    for prefix in [r"\\.\", r"\\?\", "//./", "//?/"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    lower
}

fn parse_hex4(s: &str) -> Option<u16> {
    let digits = s.get(..4)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

fn parse_usb_identity(normalized: &str) -> Option<(u16, u16, Option<String>)> {
    let vid_at = normalized.find("vid_")?;
    let vid = parse_hex4(&normalized[vid_at + 4..])?;

    let pid_at = normalized[vid_at..].find("pid_")? + vid_at;
    let pid = parse_hex4(&normalized[pid_at + 4..])?;

    // usb#vid_xxxx&pid_xxxx#<instance>#{guid}
    let serial = normalized[pid_at..]
        .split('#')
        .nth(1)
        .filter(|s| !s.is_empty() && !s.starts_with('{'))
        .map(str::to_string);

    Some((vid, pid, serial))
}

fn is_serial_port(normalized: &str) -> bool {
    if let Some(num) = normalized.strip_prefix("com") {
        return !num.is_empty() && num.chars().all(|c| c.is_ascii_digit());
    }
    normalized.starts_with("/dev/ttys")
        || normalized.starts_with("/dev/ttyusb")
        || normalized.starts_with("/dev/ttyacm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_interface_path() {
        let desc = DeviceDescriptor::from_path(
            r"\\?\USB#VID_0547&PID_2750#5&2a7b8c&0&1#{ae18aa60-7f6a-11d4-97dd-00010229b959}",
        );
        assert!(desc.matches_usb(0x0547, 0x2750));
        assert_eq!(desc.serial.as_deref(), Some("5&2a7b8c&0&1"));
        assert!(desc.has(Capability::Usb));
        assert!(!desc.has(Capability::File));
    }

    #[test]
    fn sign_is_not_a_hex_digit() {
        let desc = DeviceDescriptor::from_path(r"\\?\usb#vid_+547&pid_2750#1");
        assert_eq!(desc.vendor_id, None);
        assert!(!desc.has(Capability::Usb));
        assert!(!DeviceDescriptor::from_path(r"\\?\usb#vid_0547&pid_+750#1").has(Capability::Usb));
    }

    #[test]
    fn recognizes_serial_ports() {
        assert!(DeviceDescriptor::from_path("COM3").has(Capability::Serial));
        assert!(DeviceDescriptor::from_path(r"\\.\COM12").has(Capability::Serial));
        assert!(DeviceDescriptor::from_path("/dev/ttyUSB0").has(Capability::Serial));
        assert!(!DeviceDescriptor::from_path("combo.txt").has(Capability::Serial));
    }

    #[test]
    fn plain_paths_are_files() {
        let desc = DeviceDescriptor::from_path(r"D:\001rom.txt");
        assert_eq!(desc.capabilities, vec![Capability::File]);
        assert_eq!(desc.vendor_id, None);
    }

    #[test]
    fn alias_comparison_ignores_prefix_and_case() {
        let desc = DeviceDescriptor::from_path(r"\\.\EZUSB-0");
        assert!(desc.path_is(r"\\.\Ezusb-0"));
        assert!(desc.path_is("ezusb-0"));
        assert!(!desc.path_is(""));
    }
}
