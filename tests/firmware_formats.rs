#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;
    use tytool::firmware::{Firmware, FirmwareSegment};

    fn write_temp(name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tytool-test-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    // :llaaaatt<data>cc with a valid checksum
    const SIMPLE_HEX: &str = "\
:0400000002940C94C6
:04000400AABBCCDDEA
:00000001FF
";

    #[test]
    fn intel_hex_loads_and_coalesces() -> Result<()> {
        let path = write_temp("simple.hex", SIMPLE_HEX.as_bytes());
        let fw = Firmware::load(&path)?;
        std::fs::remove_file(&path).ok();

        // The two contiguous records merge into one segment
        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.min_address(), 0);
        assert_eq!(fw.max_address(), 7);
        assert_eq!(fw.total_size(), 8);
        assert_eq!(fw.segments()[0].data, vec![0x02, 0x94, 0x0C, 0x94, 0xAA, 0xBB, 0xCC, 0xDD]);
        Ok(())
    }

    #[test]
    fn intel_hex_rejects_bad_checksums() {
        let path = write_temp("bad.hex", b":0400000002940C9400\n:00000001FF\n");
        let result = Firmware::load(&path);
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }

    #[test]
    fn intel_hex_requires_an_eof_record() {
        let path = write_temp("noeof.hex", b":0400000002940C9466\n");
        let result = Firmware::load(&path);
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }

    #[test]
    fn intel_hex_extended_linear_addressing() -> Result<()> {
        // 0x6000 << 16 base, then 4 bytes at offset 0
        let hex = ":0200000460009A\n:0400000046434642EB\n:00000001FF\n";
        let path = write_temp("ext.hex", hex.as_bytes());
        let fw = Firmware::load(&path)?;
        std::fs::remove_file(&path).ok();

        assert_eq!(fw.min_address(), 0x6000_0000);
        assert_eq!(fw.segments()[0].data, b"FCFB");
        Ok(())
    }

    #[test]
    fn hex_round_trips_through_emission() -> Result<()> {
        let segments = vec![
            FirmwareSegment { address: 0, data: (0..64u32).map(|v| v as u8).collect() },
            FirmwareSegment { address: 0x1000, data: vec![0x55; 40] },
        ];
        let fw = Firmware::from_segments("image".into(), "image.hex".into(), segments)?;

        let emitted = fw.to_ihex();
        let path = write_temp("roundtrip.hex", emitted.as_bytes());
        let reloaded = Firmware::load(&path)?;
        std::fs::remove_file(&path).ok();

        assert_eq!(fw.segments(), reloaded.segments());
        assert_eq!(fw.total_size(), reloaded.total_size());
        Ok(())
    }

    #[test]
    fn srec_loads_with_checksums() -> Result<()> {
        // S1: count 0x07, address 0x0000, data DE AD BE EF
        let srec = "S00600004844521B\nS1070000DEADBEEFC0\nS9030000FC\n";
        let path = write_temp("data.srec", srec.as_bytes());
        let fw = Firmware::load(&path)?;
        std::fs::remove_file(&path).ok();

        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.segments()[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        Ok(())
    }

    #[test]
    fn srec_rejects_corrupt_records() {
        let path = write_temp("bad.srec", b"S1070000DEADBEEF00\nS9030000FC\n");
        let result = Firmware::load(&path);
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }

    #[test]
    fn raw_binary_is_one_segment_at_zero() -> Result<()> {
        let path = write_temp("blob.bin", &[1, 2, 3, 4, 5]);
        let fw = Firmware::load(&path)?;
        std::fs::remove_file(&path).ok();

        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.min_address(), 0);
        assert_eq!(fw.total_size(), 5);
        Ok(())
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let segments = vec![
            FirmwareSegment { address: 0, data: vec![0; 16] },
            FirmwareSegment { address: 8, data: vec![1; 16] },
        ];
        assert!(Firmware::from_segments("bad".into(), "bad".into(), segments).is_err());
    }

    #[test]
    fn segments_are_sorted_and_bounded() -> Result<()> {
        let segments = vec![
            FirmwareSegment { address: 0x100, data: vec![1; 8] },
            FirmwareSegment { address: 0x10, data: vec![2; 8] },
        ];
        let fw = Firmware::from_segments("two".into(), "two".into(), segments)?;

        assert!(fw.segments().windows(2).all(|pair| pair[0].address < pair[1].address));
        for segment in fw.segments() {
            assert!(segment.address as u64 + segment.data.len() as u64 <= fw.max_address() as u64 + 1);
        }
        Ok(())
    }

    #[test]
    fn empty_images_are_rejected() {
        assert!(Firmware::from_segments("empty".into(), "empty".into(), Vec::new()).is_err());
    }

    #[test]
    fn elf_load_segments_use_physical_addresses() -> Result<()> {
        // Minimal ELF32 (little endian, ARM) with one PT_LOAD segment: 52-byte
        // header, one 32-byte program header, then 8 bytes of payload
        let mut elf: Vec<u8> = Vec::new();
        elf.extend_from_slice(b"\x7fELF\x01\x01\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00");
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        elf.extend_from_slice(&40u16.to_le_bytes()); // e_machine = EM_ARM
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_entry
        elf.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
        elf.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
        elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

        elf.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
        elf.extend_from_slice(&84u32.to_le_bytes()); // p_offset
        elf.extend_from_slice(&0x2000_0000u32.to_le_bytes()); // p_vaddr (RAM)
        elf.extend_from_slice(&0x0000_4000u32.to_le_bytes()); // p_paddr (flash)
        elf.extend_from_slice(&8u32.to_le_bytes()); // p_filesz
        elf.extend_from_slice(&8u32.to_le_bytes()); // p_memsz
        elf.extend_from_slice(&5u32.to_le_bytes()); // p_flags
        elf.extend_from_slice(&4u32.to_le_bytes()); // p_align
        elf.extend_from_slice(&[0xAA; 8]);

        let path = write_temp("image.elf", &elf);
        let fw = Firmware::load(&path)?;
        std::fs::remove_file(&path).ok();

        assert_eq!(fw.segments().len(), 1);
        assert_eq!(fw.min_address(), 0x4000);
        assert_eq!(fw.segments()[0].data, vec![0xAA; 8]);
        Ok(())
    }
}
