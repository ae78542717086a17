//! devd event decoding
//!
//! Notifications look like
//! `!system=USB subsystem=DEVICE type=ATTACH ugen=ugen4.3 cdev=ugen4.3 ...`.
//! Only the leading `!` form is understood; `system`, `subsystem`, `type` and
//! `cdev` are extracted and everything else is ignored.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventSystem {
    Ifnet,
    Usb,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    Attach,
    #[default]
    Other,
}

/// Decoded `!`-style devd notification
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevdEvent {
    pub system: EventSystem,
    pub kind: EventType,
    pub subsystem: String,
    pub cdev: String,
}

impl DevdEvent {
    /// Decode one event string. Returns `None` for anything that does not
    /// start with `!`.
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix('!')?;
        let mut event = Self::default();

        for token in body.split([' ', '\n']).filter(|t| !t.is_empty()) {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "system" => {
                    event.system = match value {
                        "IFNET" => EventSystem::Ifnet,
                        "USB" => EventSystem::Usb,
                        _ => EventSystem::Other,
                    }
                }
                "type" => {
                    event.kind = match value {
                        "ATTACH" => EventType::Attach,
                        _ => EventType::Other,
                    }
                }
                "subsystem" => event.subsystem = value.to_string(),
                "cdev" => event.cdev = value.to_string(),
                _ => {}
            }
        }

        Some(event)
    }

    pub fn is_attach(&self) -> bool {
        self.kind == EventType::Attach
    }
}

impl fmt::Display for DevdEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "system={:?} type={:?} subsystem={} cdev={}",
            self.system, self.kind, self.subsystem, self.cdev
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USB_DEVICE: &str = "!system=USB subsystem=DEVICE type=ATTACH \
        ugen=ugen4.3 cdev=ugen4.3 vendor=0x8564 product=0x1000 devclass=0x00 \
        devsubclass=0x00 sernum=\"15H0FJ69EWI876TT\" release=0x1100 mode=host \
        port=3 parent=ugen4.1";

    const USB_INTERFACE: &str = "!system=USB subsystem=INTERFACE type=ATTACH \
        ugen=ugen4.3 cdev=ugen4.3 vendor=0x8564 product=0x1000 devclass=0x00 \
        devsubclass=0x00 sernum=\"15H0FJ69EWI876TT\" release=0x1100 mode=host \
        interface=0 endpoints=2 intclass=0x08 intsubclass=0x06 intprotocol=0x50\n";

    #[test]
    fn test_parse_usb_device_attach() {
        let ev = DevdEvent::parse(USB_DEVICE).unwrap();
        assert_eq!(ev.system, EventSystem::Usb);
        assert_eq!(ev.kind, EventType::Attach);
        assert_eq!(ev.cdev, "ugen4.3");
        assert_eq!(ev.subsystem, "DEVICE");
        assert!(ev.is_attach());
    }

    #[test]
    fn test_parse_usb_interface_attach() {
        let ev = DevdEvent::parse(USB_INTERFACE).unwrap();
        assert_eq!(ev.system, EventSystem::Usb);
        assert_eq!(ev.kind, EventType::Attach);
        assert_eq!(ev.cdev, "ugen4.3");
        assert_eq!(ev.subsystem, "INTERFACE");
    }

    #[test]
    fn test_parse_ifnet() {
        let ev = DevdEvent::parse("!system=IFNET subsystem=ue0 type=ATTACH").unwrap();
        assert_eq!(ev.system, EventSystem::Ifnet);
        assert_eq!(ev.subsystem, "ue0");
    }

    #[test]
    fn test_unknown_values_and_bare_tokens() {
        let ev = DevdEvent::parse("!system=ACPI junk type=DETACH  extra").unwrap();
        assert_eq!(ev.system, EventSystem::Other);
        assert_eq!(ev.kind, EventType::Other);
        assert_eq!(ev.subsystem, "");
        assert_eq!(ev.cdev, "");
        assert!(!ev.is_attach());
    }

    #[test]
    fn test_non_bang_events_are_invalid() {
        assert_eq!(DevdEvent::parse("+uhid0 at bus=0"), None);
        assert_eq!(DevdEvent::parse("system=USB type=ATTACH"), None);
        assert_eq!(DevdEvent::parse(""), None);
    }

    proptest::proptest! {
        #[test]
        fn test_only_bang_strings_decode(raw in "[ -~]{0,80}") {
            proptest::prop_assert_eq!(DevdEvent::parse(&raw).is_some(), raw.starts_with('!'));
        }

        #[test]
        fn test_cdev_is_extracted(cdev in "ugen[0-9]{1,2}\\.[0-9]{1,2}") {
            let raw = format!("!system=USB type=ATTACH cdev={cdev} subsystem=DEVICE");
            let ev = DevdEvent::parse(&raw).unwrap();
            proptest::prop_assert_eq!(&ev.cdev, &cdev);
            proptest::prop_assert!(ev.is_attach());
        }
    }
}
