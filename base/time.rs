// This file is part of tpsdvr, a TPS DVR web player.
// Copyright (C) 2026 The tpsdvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time-zone handling.
//!
//! All wall-clock values in the TPS format are plain unix seconds; the zone
//! only matters when projecting them onto civil dates for the recording
//! browser. The zone is process-global and mutable: the operator can retarget
//! it at runtime through `POST /api/v1/config`.

use std::sync::{OnceLock, RwLock};

use crate::{err, Error};

/// Earliest plausible recording time: 2020-01-01T00:00:00Z. Records with
/// timestamps before this are garbage left by the firmware.
pub const MIN_VALID_TIME: i64 = 1_577_836_800;

static GLOBAL_ZONE: OnceLock<RwLock<jiff::tz::TimeZone>> = OnceLock::new();

fn cell() -> &'static RwLock<jiff::tz::TimeZone> {
    GLOBAL_ZONE.get_or_init(|| RwLock::new(jiff::tz::TimeZone::system()))
}

/// Returns the zone used for all civil-date computations.
pub fn global_zone() -> jiff::tz::TimeZone {
    cell().read().expect("zone lock should be unpoisoned").clone()
}

/// Replaces the global zone, validating the IANA name first.
pub fn set_global_zone(name: &str) -> Result<(), Error> {
    let tz = jiff::tz::TimeZone::get(name)
        .map_err(|e| err!(InvalidArgument, msg("invalid time zone {name:?}"), source(e)))?;
    *cell().write().expect("zone lock should be unpoisoned") = tz;
    Ok(())
}

/// Returns the IANA name of the global zone, or `"UTC"` for an unnamed zone
/// (e.g. a fixed offset resolved from `/etc/localtime`).
pub fn global_zone_name() -> String {
    global_zone().iana_name().unwrap_or("UTC").to_owned()
}

/// Converts unix seconds to a `Zoned` in the given zone.
///
/// `secs` must be within jiff's representable range; callers pass values
/// already validated against [`MIN_VALID_TIME`].
pub fn zoned(secs: i64, tz: &jiff::tz::TimeZone) -> Result<jiff::Zoned, Error> {
    let ts = jiff::Timestamp::from_second(secs)
        .map_err(|e| err!(OutOfRange, msg("timestamp {secs} out of range"), source(e)))?;
    Ok(ts.to_zoned(tz.clone()))
}

pub mod testutil {
    /// Pins the global zone for tests that assert on civil dates.
    pub fn init_zone(name: &str) {
        super::set_global_zone(name).expect("test zone should exist");
    }
}
