#[cfg(test)]
mod tests {
    use tytool::hid_report::parse_report_descriptor;

    // Usage page 0xFF9C (vendor), usage 0x24, one collection wrapping an input
    #[rustfmt::skip]
    const HALFKAY_DESCRIPTOR: &[u8] = &[
        0x06, 0x9C, 0xFF, // Usage Page (vendor 0xFF9C)
        0x09, 0x24,       // Usage (0x24)
        0xA1, 0x01,       // Collection (Application)
        0x09, 0x01,       //   Usage
        0x15, 0x00,       //   Logical Minimum
        0x26, 0xFF, 0x00, //   Logical Maximum
        0x75, 0x08,       //   Report Size
        0x95, 0x40,       //   Report Count
        0x91, 0x02,       //   Output
        0xC0,             // End Collection
    ];

    #[test]
    fn extracts_top_level_usage_page_and_usage() {
        let info = parse_report_descriptor(HALFKAY_DESCRIPTOR, "test");

        assert_eq!(info.usage_page, 0xFF9C);
        assert_eq!(info.usage, 0x24);
        assert!(!info.numbered_reports);
    }

    #[test]
    fn usages_inside_collections_are_ignored() {
        // The usage 0x01 inside the collection must not clobber the top-level one
        let info = parse_report_descriptor(HALFKAY_DESCRIPTOR, "test");
        assert_eq!(info.usage, 0x24);
    }

    #[test]
    fn report_ids_set_the_numbered_flag() {
        let desc: &[u8] = &[
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x09, 0x06, // Usage (Keyboard)
            0xA1, 0x01, // Collection
            0x85, 0x01, //   Report ID (1)
            0xC0,
        ];
        let info = parse_report_descriptor(desc, "test");

        assert!(info.numbered_reports);
        assert_eq!(info.usage_page, 0x0001);
        assert_eq!(info.usage, 0x0006);
    }

    #[test]
    fn four_byte_items_decode_little_endian() {
        // Size bits of 3 mean 4 data bytes
        let desc: &[u8] = &[0x07, 0x9C, 0xFF, 0x00, 0x00];
        let info = parse_report_descriptor(desc, "test");

        assert_eq!(info.usage_page, 0xFF9C);
    }

    #[test]
    fn truncated_items_stop_without_panicking() {
        // The usage-page item claims 2 data bytes but only 1 is present
        let desc: &[u8] = &[0x09, 0x24, 0x06, 0x9C];
        let info = parse_report_descriptor(desc, "test");

        // The value parsed before the malformed item is retained
        assert_eq!(info.usage, 0x24);
        assert_eq!(info.usage_page, 0);
    }

    #[test]
    fn empty_and_garbage_input_is_tolerated() {
        parse_report_descriptor(&[], "test");
        parse_report_descriptor(&[0xFF], "test");
        parse_report_descriptor(&[0xFE], "test");
        parse_report_descriptor(&[0xFE, 0xFF], "test");

        let garbage: Vec<u8> = (0..=255).collect();
        parse_report_descriptor(&garbage, "test");
    }

    #[test]
    fn long_items_are_skipped() {
        let desc: &[u8] = &[
            0xFE, 0x02, 0x00, 0xAA, 0xBB, // long item, 2 payload bytes
            0x06, 0x9C, 0xFF, // Usage Page
        ];
        let info = parse_report_descriptor(desc, "test");

        assert_eq!(info.usage_page, 0xFF9C);
    }
}
