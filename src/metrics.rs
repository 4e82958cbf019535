//! The registered metric set and the per-scrape sample sink.
//!
//! Metric names and label sets are externally observed; changing any of them
//! breaks existing dashboards and alerts.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::prelude::*;

/// Exporter name, also the prefix of every metric family.
pub const NAMESPACE: &str = "powerwall";

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Gauge,
    Counter,
}

/// One registered metric family.
pub struct Descriptor {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    pub kind: Kind,
}

const fn gauge(
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
) -> Descriptor {
    Descriptor { name, help, labels, kind: Kind::Gauge }
}

const fn counter(
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
) -> Descriptor {
    Descriptor { name, help, labels, kind: Kind::Counter }
}

/// Every family this exporter exposes.
pub const DESCRIPTORS: &[Descriptor] = &[
    // Device information.
    gauge("info", "Device Information", &["version", "git_hash"]),
    counter("uptime_seconds", "Seconds since last reboot", &[]),
    counter("commission_count", "Number of config changes since last reboot", &[]),
    // Charge.
    gauge("charge_ratio", "Total amount of charge", &[]),
    gauge("reserve_ratio", "Amount of charge reserved for backup use", &[]),
    gauge("operation_mode", "Operational Mode", &["mode"]),
    // Sitemaster.
    gauge("sitemaster_running", "Is powerwall in running or stopped state?", &[]),
    gauge("sitemaster_connected", "Is powerwall connected to Tesla?", &[]),
    gauge("power_supply_mode", "Is powerwall in 'power supply' mode?", &[]),
    gauge(
        "sitemaster_busy",
        "Is sitemaster performing some operation which should not be interrupted by stop/reboot?",
        &["reason"],
    ),
    gauge("problems_detected_count", "Number of problems currently reported", &[]),
    // System status.
    gauge("full_pack_joules", "Total capacity of all batteries", &[]),
    gauge("remaining_joules", "Remaining charge in all batteries", &[]),
    gauge(
        "island_state",
        "Whether powerwall is running in island mode or connected to grid",
        &["state"],
    ),
    // Per-battery status.
    gauge("battery_info", "Battery Information", &["serial", "partno", "version"]),
    gauge("battery_full_pack_joules", "Total battery capacity", &["serial"]),
    gauge("battery_remaining_joules", "Remaining charge", &["serial"]),
    gauge("battery_output_volts", "Battery voltage", &["serial"]),
    gauge(
        "battery_output_amps",
        "Battery current flow (positive is discharging, negative is charging)",
        &["serial"],
    ),
    gauge("battery_output_hz", "Battery output frequency", &["serial"]),
    counter(
        "battery_charged_joules_total",
        "Total amount of energy charged over battery's lifetime",
        &["serial"],
    ),
    counter(
        "battery_discharged_joules_total",
        "Total amount of energy discharged over battery's lifetime",
        &["serial"],
    ),
    gauge("battery_off_grid", "Is battery disconnected from the grid?", &["serial"]),
    gauge("battery_island_state", "Is battery running in islanded state?", &["serial"]),
    gauge("battery_wobble_detected", "Is frequency wobble detected?", &["serial"]),
    gauge("battery_charge_power_clamped", "Has charging power been clamped?", &["serial"]),
    gauge("battery_backup_ready", "Is battery available for backup use?", &["serial"]),
    gauge("battery_pinv_state", "Battery power inverter state", &["serial", "state"]),
    gauge("battery_pinv_grid_state", "Battery power grid state", &["serial", "state"]),
    gauge("battery_opseq_state", "Battery operation sequence state", &["serial", "state"]),
    // Per-category meter aggregates.
    gauge("instant_power_watts", "Instant Power (W)", &["category"]),
    gauge("instant_reactive_power_watts", "Instant Reactive Power (W)", &["category"]),
    gauge("instant_apparent_power_watts", "Instant Apparent Power (W)", &["category"]),
    gauge("frequency_hz", "AC Frequency (Hz)", &["category"]),
    counter("exported_joules_total", "Energy Exported", &["category"]),
    counter("imported_joules_total", "Energy Imported", &["category"]),
    gauge("instant_average_volts", "Instant Average Voltage", &["category"]),
    gauge("instant_average_amps", "Instant Average Current", &["category"]),
    gauge("instant_total_amps", "Instant Total Current", &["category"]),
    // Per-device meter readings.
    gauge("dev_instant_power_watts", "Instant Power (W)", &["category", "type", "serial"]),
    gauge(
        "dev_instant_reactive_power_watts",
        "Instant Reactive Power (W)",
        &["category", "type", "serial"],
    ),
    gauge(
        "dev_instant_apparent_power_watts",
        "Instant Apparent Power (W)",
        &["category", "type", "serial"],
    ),
    gauge("dev_frequency_hz", "AC Frequency (Hz)", &["category", "type", "serial"]),
    counter("dev_exported_joules_total", "Energy Exported", &["category", "type", "serial"]),
    counter("dev_imported_joules_total", "Energy Imported", &["category", "type", "serial"]),
    gauge("dev_instant_average_volts", "Instant Average Voltage", &["category", "type", "serial"]),
    gauge("dev_instant_average_amps", "Instant Average Current", &["category", "type", "serial"]),
    gauge("dev_instant_total_amps", "Instant Total Current", &["category", "type", "serial"]),
    // Network interfaces.
    gauge("network_enabled", "Is network interface enabled?", &["type", "name"]),
    gauge("network_active", "Is network interface active?", &["type", "name"]),
    gauge("network_primary", "Is this the primary network interface?", &["type", "name"]),
    gauge(
        "network_state",
        "Current state and reason for last state change",
        &["type", "name", "state", "reason"],
    ),
    gauge("network_signal_strength", "Wireless signal strength", &["type", "name"]),
];

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

/// Samples accumulated during a single scrape.
///
/// Every registered family is advertised up front, whether or not a sample
/// lands in it. An emission whose label values do not match the family's
/// label names is logged and dropped, never panics.
pub struct Scrape {
    registry: Registry,
    families: HashMap<&'static str, Family>,
    dropped_samples: AtomicUsize,
}

impl Scrape {
    pub fn try_new() -> Result<Self> {
        let registry = Registry::new();
        let mut families = HashMap::with_capacity(DESCRIPTORS.len());
        for descriptor in DESCRIPTORS {
            let opts = Opts::new(format!("{NAMESPACE}_{}", descriptor.name), descriptor.help);
            let family = match descriptor.kind {
                Kind::Gauge => {
                    let vec = GaugeVec::new(opts, descriptor.labels)
                        .with_context(|| format!("invalid gauge family `{}`", descriptor.name))?;
                    registry.register(Box::new(vec.clone()))?;
                    Family::Gauge(vec)
                }
                Kind::Counter => {
                    let vec = CounterVec::new(opts, descriptor.labels)
                        .with_context(|| format!("invalid counter family `{}`", descriptor.name))?;
                    registry.register(Box::new(vec.clone()))?;
                    Family::Counter(vec)
                }
            };
            families.insert(descriptor.name, family);
        }
        Ok(Self { registry, families, dropped_samples: AtomicUsize::new(0) })
    }

    pub fn gauge(&self, name: &'static str, value: f64, labels: &[&str]) {
        match self.families.get(name) {
            Some(Family::Gauge(family)) => match family.get_metric_with_label_values(labels) {
                Ok(gauge) => gauge.set(value),
                Err(error) => self.drop_sample(name, error),
            },
            Some(Family::Counter(_)) => self.drop_sample(name, "not a gauge family"),
            None => self.drop_sample(name, "unregistered family"),
        }
    }

    pub fn gauge_bool(&self, name: &'static str, value: bool, labels: &[&str]) {
        self.gauge(name, if value { 1.0 } else { 0.0 }, labels);
    }

    /// Set a counter to its absolute lifetime value.
    ///
    /// The registry is fresh per scrape, so a single increment lands the
    /// counter exactly at the device-reported total.
    pub fn counter(&self, name: &'static str, value: f64, labels: &[&str]) {
        if value < 0.0 {
            self.drop_sample(name, "negative counter value");
            return;
        }
        match self.families.get(name) {
            Some(Family::Counter(family)) => match family.get_metric_with_label_values(labels) {
                Ok(counter) => counter.inc_by(value),
                Err(error) => self.drop_sample(name, error),
            },
            Some(Family::Gauge(_)) => self.drop_sample(name, "not a counter family"),
            None => self.drop_sample(name, "unregistered family"),
        }
    }

    /// Number of samples lost to emission errors during this scrape.
    pub fn dropped_samples(&self) -> usize {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    /// Encode the accumulated samples in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode the samples")?;
        String::from_utf8(buffer).context("the encoded samples are not valid UTF-8")
    }

    fn drop_sample(&self, name: &str, reason: impl std::fmt::Display) {
        self.dropped_samples.fetch_add(1, Ordering::Relaxed);
        error!(metric = name, "dropped a sample: {reason}");
    }
}
