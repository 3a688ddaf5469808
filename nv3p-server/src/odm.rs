// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! ODM extension commands and chip services.

use crate::platform::{Diagnostic, Platform};
use crate::server::{receive_stream, Abort, Failure, OrStatus, Server};
use crate::storage::Storage;
use crate::transport::{Transport, TransportError};
use chrono::DateTime;
use consts::{BOOT_ROM_VERSION, SECONDS_1970_TO_2009};
use log::info;
use nv3p_protocol::{OdmExtCommand, PlatformInfo, Response, StatusCode};

impl<T: Transport, S: Storage, P: Platform> Server<T, S, P> {
    pub(crate) fn odm_command(&mut self, command: OdmExtCommand) -> Result<(), TransportError> {
        let diagnostic = match command {
            OdmExtCommand::FuelGaugeFwUpgrade {
                file_length1,
                file_length2,
            } => return self.fuel_gauge_upgrade(file_length1, file_length2),
            OdmExtCommand::VerifySdram { .. } => {
                return self.reject(
                    "OdmCommand",
                    Failure::new(
                        StatusCode::NotImplemented,
                        "SDRAM can only be verified by the miniloader",
                    ),
                )
            }
            OdmExtCommand::Vendor { code } => {
                return self.reject(
                    "OdmCommand",
                    Failure::new(
                        StatusCode::NotImplemented,
                        format!("unknown ODM command {code:#x}"),
                    ),
                )
            }
            OdmExtCommand::RunSdDiag { test_type, value } => Diagnostic::Sd { test_type, value },
            OdmExtCommand::RunSeDiag { value } => Diagnostic::Se { value },
            OdmExtCommand::RunPwmDiag => Diagnostic::Pwm,
            OdmExtCommand::RunDsiDiag => Diagnostic::Dsi,
        };

        let result = self
            .platform
            .run_diagnostic(diagnostic)
            .or_status(StatusCode::Unknown)
            .map(|_| {
                info!("{diagnostic:?} diagnostic passed");
                Response::None
            });
        self.complete("OdmCommand", result)
    }

    fn fuel_gauge_upgrade(&mut self, first_len: u64, second_len: u64) -> Result<(), TransportError> {
        if first_len == 0 {
            return self.reject(
                "OdmCommand",
                Failure::new(StatusCode::BadParameter, "empty fuel gauge firmware"),
            );
        }
        self.transport.command_complete(Response::None)?;

        let result = self.receive_file(first_len).and_then(|first| {
            let second = match second_len {
                0 => None,
                len => Some(self.receive_file(len)?),
            };
            self.platform
                .fuel_gauge_upgrade(&first, second.as_deref())
                .or_status(StatusCode::FuelGaugeFwUpgradeFailure)?;
            info!("Fuel gauge firmware upgraded");
            Ok(())
        });
        self.finish("OdmCommand", result)
    }

    fn receive_file(&mut self, length: u64) -> Result<Vec<u8>, Abort> {
        let mut file = Vec::new();
        receive_stream(&mut self.transport, &mut self.staging, length, |chunk, _| {
            file.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(file)
    }

    pub(crate) fn set_time(&mut self, seconds: u64) -> Result<(), TransportError> {
        let result = self.write_rtc(seconds).map(|_| Response::None);
        self.complete("SetTime", result)
    }

    fn write_rtc(&mut self, seconds: u64) -> Result<(), Failure> {
        let rtc = seconds
            .checked_sub(SECONDS_1970_TO_2009)
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(|| {
                Failure::new(
                    StatusCode::BadParameter,
                    format!("time {seconds} out of the RTC range"),
                )
            })?;
        self.platform.write_rtc(rtc).or_status(StatusCode::Unknown)?;
        match i64::try_from(seconds).ok().and_then(|s| DateTime::from_timestamp(s, 0)) {
            Some(time) => info!("RTC set to {time}"),
            None => info!("RTC set to {rtc}"),
        }
        Ok(())
    }

    pub(crate) fn get_platform_info(&mut self) -> Result<(), TransportError> {
        let fuses = self.platform.fuses();
        let info = PlatformInfo {
            chip_id: self.platform.chip_id(),
            chip_sku: fuses.sku,
            chip_uid: fuses.unique_id,
            boot_rom_version: BOOT_ROM_VERSION,
            secondary_boot_device: self.platform.secondary_boot_device().map(|d| d.kind),
            operating_mode: self.platform.operating_mode(),
            sbk_burned: fuses.sbk_burned,
            dk_burned: fuses.dk,
        };
        self.complete("GetPlatformInfo", Ok(Response::PlatformInfo(info)))
    }
}
