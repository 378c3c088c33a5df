// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025-2026 The tytool contributors
//! Cross-platform toolkit for discovering, monitoring and reprogramming Teensy
//! development boards exposed as USB HID and CDC-ACM serial interfaces.
//!
//! The layers, bottom up:
//! - [platform], [error]: clock/poll plumbing and the error model
//! - [device], [match_spec], [hid_report], [monitor], [port]: uniform device
//!   enumeration, hotplug events and per-interface I/O over the native OS
//!   stacks (udev/hidraw, SetupAPI/overlapped I/O, IOKit)
//! - [models], [board], [firmware], [halfkay], [task]: the board model —
//!   interfaces grouped into logical boards, firmware images, the bootloader
//!   protocol and the task engine that drives long-running operations

pub mod board;
pub mod device;
pub mod error;
pub mod firmware;
pub mod halfkay;
pub mod hid_report;
pub mod match_spec;
pub mod models;
pub mod monitor;
pub mod platform;
pub mod port;
pub mod settings;
pub mod task;
