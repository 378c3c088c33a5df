#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use color_eyre::eyre::Result;
    use tytool::device::{Device, DeviceType};
    use tytool::match_spec::{MatchSet, MatchSpec};

    fn device(dev_type: DeviceType, vid: u16, pid: u16) -> Arc<Device> {
        let mut dev = Device::new(
            dev_type,
            "key".to_string(),
            "usb-1-2".to_string(),
            "/dev/null".to_string(),
        );
        dev.vid = vid;
        dev.pid = pid;
        Arc::new(dev)
    }

    #[test]
    fn parses_vid_pid() -> Result<()> {
        let spec: MatchSpec = "16c0:0478".parse()?;

        assert!(spec.matches(&device(DeviceType::Hid, 0x16C0, 0x0478)));
        assert!(spec.matches(&device(DeviceType::Serial, 0x16C0, 0x0478)));
        assert!(!spec.matches(&device(DeviceType::Hid, 0x16C0, 0x0483)));
        Ok(())
    }

    #[test]
    fn parses_type_suffix() -> Result<()> {
        let spec: MatchSpec = "16c0:0483/serial".parse()?;

        assert!(spec.matches(&device(DeviceType::Serial, 0x16C0, 0x0483)));
        assert!(!spec.matches(&device(DeviceType::Hid, 0x16C0, 0x0483)));
        Ok(())
    }

    #[test]
    fn zero_values_match_anything() -> Result<()> {
        let spec: MatchSpec = "0000:0000".parse()?;

        assert!(spec.matches(&device(DeviceType::Hid, 0x1234, 0x5678)));
        Ok(())
    }

    #[test]
    fn leading_whitespace_is_tolerated() -> Result<()> {
        let spec: MatchSpec = "  16c0:0478/hid".parse()?;
        assert!(spec.matches(&device(DeviceType::Hid, 0x16C0, 0x0478)));
        Ok(())
    }

    #[test]
    fn display_round_trips_through_parse() -> Result<()> {
        for input in ["16c0:0478", "16c0:0483/serial", "0000:0000", "1234:5678/hid"] {
            let spec: MatchSpec = input.parse()?;
            let reparsed: MatchSpec = spec.to_string().parse()?;
            assert_eq!(spec, reparsed);
        }
        Ok(())
    }

    #[test]
    fn malformed_strings_are_parse_errors() {
        assert!("16c0".parse::<MatchSpec>().is_err());
        assert!("xyz:0478".parse::<MatchSpec>().is_err());
        assert!("16c0:0478/floppy".parse::<MatchSpec>().is_err());
    }

    #[test]
    fn match_set_carries_the_spec_tag() {
        let specs = vec![
            MatchSpec::new().vid_pid(0x16C0, 0x0478).with_tag(7),
            MatchSpec::new().vid_pid(0x16C0, 0x0483).with_tag(9),
        ];
        let set = MatchSet::new(specs);

        assert_eq!(set.matches(&device(DeviceType::Hid, 0x16C0, 0x0478)), Some(7));
        assert_eq!(set.matches(&device(DeviceType::Serial, 0x16C0, 0x0483)), Some(9));
        assert_eq!(set.matches(&device(DeviceType::Serial, 0x16C0, 0x0999)), None);
    }

    #[test]
    fn empty_match_set_accepts_everything() {
        let set = MatchSet::new(Vec::new());

        assert!(set.has_type(DeviceType::Hid));
        assert!(set.has_type(DeviceType::Serial));
        assert_eq!(set.matches(&device(DeviceType::Hid, 1, 2)), Some(0));
    }

    #[test]
    fn type_mask_reflects_the_specs() {
        let set = MatchSet::new(vec![MatchSpec::new().dev_type(DeviceType::Serial)]);

        assert!(set.has_type(DeviceType::Serial));
        assert!(!set.has_type(DeviceType::Hid));

        // One untyped spec widens the mask back to everything
        let set = MatchSet::new(vec![
            MatchSpec::new().dev_type(DeviceType::Serial),
            MatchSpec::new().vid_pid(0x16C0, 0),
        ]);
        assert!(set.has_type(DeviceType::Hid));
    }
}
