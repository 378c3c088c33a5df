#[cfg(test)]
mod tests {
    use tytool::error::{ErrorKind, last_error_message};
    use tytool::platform::{PollSource, adjust_timeout, millis, poll};

    #[test]
    fn millis_is_monotonic() {
        let a = millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = millis();
        assert!(b >= a + 5);
    }

    #[test]
    fn adjust_timeout_counts_down_and_saturates() {
        let start = millis();
        let remaining = adjust_timeout(10_000, start);
        assert!(remaining > 0 && remaining <= 10_000);

        // An already-expired start clamps to zero
        assert_eq!(adjust_timeout(0, start), 0);
        // Infinite timeouts pass through
        assert_eq!(adjust_timeout(-1, 0), -1);
    }

    #[cfg(unix)]
    #[test]
    fn poll_with_zero_timeout_never_blocks() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let started = std::time::Instant::now();
        let mut sources = [PollSource::new(fds[0], 1)];
        let ready = poll(&mut sources, 0).unwrap();

        assert_eq!(ready, 0);
        assert!(!sources[0].ready);
        assert!(started.elapsed().as_millis() < 100);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[cfg(unix)]
    #[test]
    fn poll_reports_readable_sources() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe {
            libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut sources = [PollSource::new(fds[0], 1)];
        let ready = poll(&mut sources, -1).unwrap();

        assert_eq!(ready, 1);
        assert!(sources[0].ready);
        assert_eq!(sources[0].tag, 1);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn reported_errors_land_in_the_thread_local_buffer() {
        let err = ErrorKind::NotFound.report("device 'x' not found");

        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message(), "device 'x' not found");
        assert_eq!(last_error_message(), "device 'x' not found");
    }

    #[test]
    fn masking_is_scoped_and_stacked() {
        assert!(!ErrorKind::NotFound.is_masked());

        {
            let _outer = ErrorKind::NotFound.mask();
            assert!(ErrorKind::NotFound.is_masked());

            {
                let _inner = ErrorKind::Io.mask();
                assert!(ErrorKind::Io.is_masked());
                assert!(ErrorKind::NotFound.is_masked());
            }

            assert!(!ErrorKind::Io.is_masked());
            assert!(ErrorKind::NotFound.is_masked());
        }

        assert!(!ErrorKind::NotFound.is_masked());
    }

    #[test]
    fn masking_does_not_change_return_values() {
        let _guard = ErrorKind::Access.mask();
        let err = ErrorKind::Access.report("permission denied for 'y'");

        // Reporting still produces the error and records the message,
        // only the log line is suppressed
        assert_eq!(err.kind, ErrorKind::Access);
        assert_eq!(last_error_message(), "permission denied for 'y'");
    }

    #[test]
    fn io_errors_map_to_matching_kinds() {
        use tytool::error::Error;

        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err: Error = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(err.kind, ErrorKind::Access);
    }
}
