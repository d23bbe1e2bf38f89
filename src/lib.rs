//! csi-recorder collects Channel State Information from ESP32 radios that
//! stream it over USB serial, and records a network camera alongside it so
//! that every CSI session comes with matching video.
//!
//! A session runs through the [session::SessionController]: it makes sure a
//! radio is connected ([connection_manager]), arms the firmware for serial
//! output ([command_channel]), starts one read loop per radio
//! ([line_reader]) feeding a single CSV writer ([collector]), and records
//! the camera in parallel ([video]). When the session closes, the CSV is
//! handed to a [summary::SessionReporter].
//!
//! Without hardware, [dummy_radio] stands in for the radios.

#![warn(missing_docs)]
pub mod args;
pub mod collector;
pub mod command_channel;
pub mod config;
pub mod connection_manager;
pub mod csi_record;
pub mod device;
pub mod dummy_radio;
pub mod gui;
pub mod line_reader;
pub mod session;
pub mod summary;
pub mod video;
