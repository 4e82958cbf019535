//! The collection pass: a fixed sequence of fetch-and-emit steps.

use std::ops::ControlFlow;

use crate::{
    api::powerwall::{
        Error as GatewayError,
        Gateway,
        models::{MeterDevice, MeterReading},
    },
    metrics::Scrape,
    prelude::*,
};

/// Source energy values are watt-hours; exposition is in joules.
const JOULES_PER_WATT_HOUR: f64 = 3600.0;

/// Runs the collection sequence against the gateway on every scrape.
pub struct Collector<G> {
    gateway: G,
}

impl<G: Gateway> Collector<G> {
    pub const fn new(gateway: G) -> Self {
        Self { gateway }
    }

    /// One full collection pass.
    ///
    /// A failed step only loses its own samples. A transport failure ends the
    /// pass early: the connection is gone, and further calls would only add
    /// latency and duplicate the error noise. The caller always gets whatever
    /// samples were collected.
    pub async fn collect(&self) -> Result<Scrape> {
        let scrape = Scrape::try_new()?;
        debug!("collecting…");
        let _ = self.run(&scrape).await;
        debug!(dropped_samples = scrape.dropped_samples(), "collected");
        Ok(scrape)
    }

    async fn run(&self, scrape: &Scrape) -> ControlFlow<()> {
        Self::check("status", self.status(scrape).await)?;
        Self::check("state of energy", self.state_of_energy(scrape).await)?;
        Self::check("operation", self.operation(scrape).await)?;
        Self::check("sitemaster", self.sitemaster(scrape).await)?;
        Self::check("problems", self.problems(scrape).await)?;
        Self::check("system status", self.system_status(scrape).await)?;
        Self::check("meters", self.meters(scrape).await)?;
        Self::check("networks", self.networks(scrape).await)?;
        ControlFlow::Continue(())
    }

    /// Log a failed step and decide whether the pass continues.
    fn check(step: &'static str, result: Result<(), GatewayError>) -> ControlFlow<()> {
        match result {
            Ok(()) => ControlFlow::Continue(()),
            Err(error) if error.is_transport() => {
                error!(step, "aborting the pass: {error}");
                ControlFlow::Break(())
            }
            Err(error) => {
                error!(step, "skipping the step: {error}");
                ControlFlow::Continue(())
            }
        }
    }

    #[expect(clippy::cast_precision_loss)]
    async fn status(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let status = self.gateway.get_status().await?;
        scrape.gauge("info", 1.0, &[&status.version, &status.git_hash]);
        scrape.counter("uptime_seconds", status.uptime.as_secs_f64(), &[]);
        scrape.counter("commission_count", status.commission_count as f64, &[]);
        Ok(())
    }

    async fn state_of_energy(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let soe = self.gateway.get_state_of_energy().await?;
        scrape.gauge("charge_ratio", soe.percentage / 100.0, &[]);
        Ok(())
    }

    async fn operation(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let operation = self.gateway.get_operation().await?;
        scrape.gauge("operation_mode", 1.0, &[&operation.real_mode]);
        scrape.gauge("reserve_ratio", operation.backup_reserve_percent / 100.0, &[]);
        Ok(())
    }

    async fn sitemaster(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let sitemaster = self.gateway.get_sitemaster().await?;
        scrape.gauge_bool("sitemaster_running", sitemaster.running, &[]);
        scrape.gauge_bool("sitemaster_connected", sitemaster.connected_to_tesla, &[]);
        scrape.gauge_bool("power_supply_mode", sitemaster.power_supply_mode, &[]);
        // Anything but a literal `Yes`, the empty string included, is a busy
        // reason.
        if sitemaster.can_reboot != "Yes" {
            scrape.gauge("sitemaster_busy", 1.0, &[&sitemaster.can_reboot]);
        }
        Ok(())
    }

    #[expect(clippy::cast_precision_loss)]
    async fn problems(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let problems = self.gateway.get_problems().await?;
        scrape.gauge("problems_detected_count", problems.problems.len() as f64, &[]);
        Ok(())
    }

    async fn system_status(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let system = self.gateway.get_system_status().await?;
        scrape.gauge(
            "full_pack_joules",
            system.nominal_full_pack_energy * JOULES_PER_WATT_HOUR,
            &[],
        );
        scrape.gauge(
            "remaining_joules",
            system.nominal_energy_remaining * JOULES_PER_WATT_HOUR,
            &[],
        );
        scrape.gauge("island_state", 1.0, &[&system.system_island_state]);
        for block in &system.battery_blocks {
            let serial = block.serial_number.as_str();
            scrape.gauge("battery_info", 1.0, &[serial, &block.part_number, &block.version]);
            scrape.gauge(
                "battery_full_pack_joules",
                block.nominal_full_pack_energy * JOULES_PER_WATT_HOUR,
                &[serial],
            );
            scrape.gauge(
                "battery_remaining_joules",
                block.nominal_energy_remaining * JOULES_PER_WATT_HOUR,
                &[serial],
            );
            scrape.gauge("battery_output_volts", block.v_out, &[serial]);
            scrape.gauge("battery_output_amps", block.i_out, &[serial]);
            scrape.gauge("battery_output_hz", block.f_out, &[serial]);
            scrape.counter(
                "battery_charged_joules_total",
                block.energy_charged * JOULES_PER_WATT_HOUR,
                &[serial],
            );
            scrape.counter(
                "battery_discharged_joules_total",
                block.energy_discharged * JOULES_PER_WATT_HOUR,
                &[serial],
            );
            scrape.gauge_bool("battery_off_grid", block.off_grid, &[serial]);
            scrape.gauge_bool("battery_island_state", block.vf_mode, &[serial]);
            scrape.gauge_bool("battery_wobble_detected", block.wobble_detected, &[serial]);
            scrape.gauge_bool(
                "battery_charge_power_clamped",
                block.charge_power_clamped,
                &[serial],
            );
            scrape.gauge_bool("battery_backup_ready", block.backup_ready, &[serial]);
            scrape.gauge("battery_pinv_state", 1.0, &[serial, &block.pinv_state]);
            scrape.gauge("battery_pinv_grid_state", 1.0, &[serial, &block.pinv_grid_state]);
            scrape.gauge("battery_opseq_state", 1.0, &[serial, &block.op_seq_state]);
        }
        Ok(())
    }

    async fn meters(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let aggregates = self.gateway.get_meter_aggregates().await?;
        for (category, reading) in &aggregates {
            Self::category_reading(scrape, category, reading);
            match self.gateway.get_meters(category).await {
                Ok(devices) => {
                    for device in &devices {
                        Self::device_reading(scrape, category, device);
                    }
                }
                Err(error) if error.is_transport() => return Err(error),
                Err(error) => error!(%category, "skipping the meter details: {error}"),
            }
        }
        Ok(())
    }

    #[expect(clippy::float_cmp)]
    fn category_reading(scrape: &Scrape, category: &str, reading: &MeterReading) {
        let labels = &[category];
        scrape.gauge("instant_power_watts", reading.instant_power, labels);
        scrape.gauge("instant_reactive_power_watts", reading.instant_reactive_power, labels);
        scrape.gauge("instant_apparent_power_watts", reading.instant_apparent_power, labels);
        if reading.frequency != 0.0 {
            scrape.gauge("frequency_hz", reading.frequency, labels);
        }
        scrape.counter(
            "exported_joules_total",
            reading.energy_exported * JOULES_PER_WATT_HOUR,
            labels,
        );
        scrape.counter(
            "imported_joules_total",
            reading.energy_imported * JOULES_PER_WATT_HOUR,
            labels,
        );
        scrape.gauge("instant_average_volts", reading.instant_average_voltage, labels);
        scrape.gauge("instant_average_amps", reading.instant_average_current, labels);
        scrape.gauge("instant_total_amps", reading.instant_total_current, labels);
    }

    #[expect(clippy::float_cmp)]
    fn device_reading(scrape: &Scrape, category: &str, device: &MeterDevice) {
        let reading = &device.cached_readings;
        let labels =
            &[category, device.device_type.as_str(), device.connection.device_serial.as_str()];
        scrape.gauge("dev_instant_power_watts", reading.instant_power, labels);
        scrape.gauge("dev_instant_reactive_power_watts", reading.instant_reactive_power, labels);
        scrape.gauge("dev_instant_apparent_power_watts", reading.instant_apparent_power, labels);
        if reading.frequency != 0.0 {
            scrape.gauge("dev_frequency_hz", reading.frequency, labels);
        }
        scrape.counter(
            "dev_exported_joules_total",
            reading.energy_exported * JOULES_PER_WATT_HOUR,
            labels,
        );
        scrape.counter(
            "dev_imported_joules_total",
            reading.energy_imported * JOULES_PER_WATT_HOUR,
            labels,
        );
        scrape.gauge("dev_instant_average_volts", reading.instant_average_voltage, labels);
        scrape.gauge("dev_instant_average_amps", reading.instant_average_current, labels);
        scrape.gauge("dev_instant_total_amps", reading.instant_total_current, labels);
    }

    async fn networks(&self, scrape: &Scrape) -> Result<(), GatewayError> {
        let networks = self.gateway.get_networks().await?;
        for network in &networks {
            let labels = &[network.interface.as_str(), network.network_name.as_str()];
            scrape.gauge_bool("network_enabled", network.enabled, labels);
            scrape.gauge_bool("network_active", network.active, labels);
            scrape.gauge_bool("network_primary", network.primary, labels);
            let info = &network.iface_network_info;
            if !info.network_name.is_empty() {
                scrape.gauge(
                    "network_state",
                    1.0,
                    &[
                        network.interface.as_str(),
                        network.network_name.as_str(),
                        info.state.as_str(),
                        info.state_reason.as_str(),
                    ],
                );
                if info.signal_strength != 0 {
                    scrape.gauge(
                        "network_signal_strength",
                        f64::from(info.signal_strength),
                        labels,
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        api::powerwall::models::{
            BatteryBlock,
            InterfaceInfo,
            MeterAggregates,
            MeterConnection,
            Network,
            Operation,
            Problems,
            Sitemaster,
            StateOfEnergy,
            Status,
            SystemStatus,
        },
        metrics::DESCRIPTORS,
    };

    /// One scripted call: a canned record or a classified failure.
    enum Call<T> {
        Ok(T),
        Transport,
        Application,
    }

    impl<T: Clone> Call<T> {
        fn resolve(&self) -> Result<T, GatewayError> {
            match self {
                Self::Ok(value) => Ok(value.clone()),
                Self::Transport => {
                    Err(GatewayError::Transport(anyhow::anyhow!("scripted connection failure")))
                }
                Self::Application => {
                    Err(GatewayError::Application(anyhow::anyhow!("scripted bad response")))
                }
            }
        }
    }

    /// Scripted gateway standing in for the appliance.
    struct FakeGateway {
        status: Call<Status>,
        state_of_energy: Call<StateOfEnergy>,
        operation: Call<Operation>,
        sitemaster: Call<Sitemaster>,
        problems: Call<Problems>,
        system_status: Call<SystemStatus>,
        meter_aggregates: Call<MeterAggregates>,
        meters: HashMap<String, Call<Vec<MeterDevice>>>,
        networks: Call<Vec<Network>>,
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        async fn get_status(&self) -> Result<Status, GatewayError> {
            self.status.resolve()
        }

        async fn get_state_of_energy(&self) -> Result<StateOfEnergy, GatewayError> {
            self.state_of_energy.resolve()
        }

        async fn get_operation(&self) -> Result<Operation, GatewayError> {
            self.operation.resolve()
        }

        async fn get_sitemaster(&self) -> Result<Sitemaster, GatewayError> {
            self.sitemaster.resolve()
        }

        async fn get_problems(&self) -> Result<Problems, GatewayError> {
            self.problems.resolve()
        }

        async fn get_system_status(&self) -> Result<SystemStatus, GatewayError> {
            self.system_status.resolve()
        }

        async fn get_meter_aggregates(&self) -> Result<MeterAggregates, GatewayError> {
            self.meter_aggregates.resolve()
        }

        async fn get_meters(&self, category: &str) -> Result<Vec<MeterDevice>, GatewayError> {
            self.meters
                .get(category)
                .map_or_else(|| Ok(Vec::new()), Call::resolve)
        }

        async fn get_networks(&self) -> Result<Vec<Network>, GatewayError> {
            self.networks.resolve()
        }
    }

    impl FakeGateway {
        /// A healthy appliance whose records hit every emission call site.
        fn healthy() -> Self {
            Self {
                status: Call::Ok(Status {
                    version: "22.36.9 ec2f0235".to_string(),
                    git_hash: "ec2f0235ebb7".to_string(),
                    uptime: Duration::from_secs(7320),
                    commission_count: 8,
                }),
                state_of_energy: Call::Ok(StateOfEnergy { percentage: 55.0 }),
                operation: Call::Ok(Operation {
                    real_mode: "self_consumption".to_string(),
                    backup_reserve_percent: 20.0,
                }),
                sitemaster: Call::Ok(Sitemaster {
                    running: true,
                    connected_to_tesla: true,
                    power_supply_mode: false,
                    // Not `Yes`, so the busy gauge is exercised too.
                    can_reboot: "UpdateInProgress".to_string(),
                }),
                problems: Call::Ok(Problems { problems: Vec::new() }),
                system_status: Call::Ok(SystemStatus {
                    nominal_full_pack_energy: 10.0,
                    nominal_energy_remaining: 7.5,
                    system_island_state: "SystemGridConnected".to_string(),
                    battery_blocks: vec![battery_block("TG0123456789AB")],
                }),
                meter_aggregates: Call::Ok(HashMap::from([
                    ("solar".to_string(), reading(1185.0, 50.01)),
                    ("load".to_string(), reading(334.0, 49.99)),
                ])),
                meters: HashMap::from([
                    ("solar".to_string(), Call::Ok(vec![device("PVS1")])),
                    ("load".to_string(), Call::Ok(vec![device("OBB1234567")])),
                ]),
                networks: Call::Ok(vec![Network {
                    network_name: "wifi_client".to_string(),
                    interface: "WifiType".to_string(),
                    enabled: true,
                    active: true,
                    primary: true,
                    iface_network_info: InterfaceInfo {
                        network_name: "wifi_client".to_string(),
                        state: "DeviceStateReady".to_string(),
                        state_reason: "DeviceStateReasonNone".to_string(),
                        signal_strength: -62,
                    },
                }]),
            }
        }
    }

    fn battery_block(serial: &str) -> BatteryBlock {
        BatteryBlock {
            serial_number: serial.to_string(),
            part_number: "1092170-03-E".to_string(),
            version: "b0ec24329c08e4".to_string(),
            nominal_full_pack_energy: 13716.0,
            nominal_energy_remaining: 7584.0,
            v_out: 245.7,
            i_out: 0.4,
            f_out: 50.024,
            energy_charged: 10_155_550.0,
            energy_discharged: 8_845_310.0,
            off_grid: false,
            vf_mode: false,
            wobble_detected: false,
            charge_power_clamped: false,
            backup_ready: true,
            pinv_state: "PINV_GridFollowing".to_string(),
            pinv_grid_state: "Grid_Compliant".to_string(),
            op_seq_state: "Active".to_string(),
        }
    }

    fn reading(instant_power: f64, frequency: f64) -> MeterReading {
        MeterReading {
            instant_power,
            instant_reactive_power: -110.0,
            instant_apparent_power: 237.0,
            frequency,
            energy_exported: 3649.8,
            energy_imported: 10269.2,
            instant_average_voltage: 245.79,
            instant_average_current: 10.86,
            instant_total_current: 10.86,
        }
    }

    fn device(serial: &str) -> MeterDevice {
        MeterDevice {
            device_type: "neurio_w2_tcp".to_string(),
            connection: MeterConnection { device_serial: serial.to_string() },
            cached_readings: reading(334.0, 49.99),
        }
    }

    async fn collect(gateway: FakeGateway) -> Result<(Scrape, String)> {
        let scrape = Collector::new(gateway).collect().await?;
        let text = scrape.render()?;
        Ok((scrape, text))
    }

    fn has_sample(text: &str, family: &str) -> bool {
        text.lines().any(|line| {
            line.strip_prefix("powerwall_")
                .and_then(|rest| rest.strip_prefix(family))
                .is_some_and(|rest| rest.starts_with('{') || rest.starts_with(' '))
        })
    }

    #[tokio::test]
    async fn healthy_scrape_covers_every_family() -> Result {
        let (scrape, text) = collect(FakeGateway::healthy()).await?;
        assert_eq!(scrape.dropped_samples(), 0);
        for descriptor in DESCRIPTORS {
            assert!(has_sample(&text, descriptor.name), "no sample for `{}`", descriptor.name);
        }
        Ok(())
    }

    #[tokio::test]
    async fn charge_ratio_is_scaled_down() -> Result {
        let (_, text) = collect(FakeGateway::healthy()).await?;
        assert!(text.contains("powerwall_charge_ratio 0.55"));
        Ok(())
    }

    #[tokio::test]
    async fn pack_energy_is_converted_to_joules() -> Result {
        let (_, text) = collect(FakeGateway::healthy()).await?;
        assert!(text.contains("powerwall_full_pack_joules 36000"));
        Ok(())
    }

    #[tokio::test]
    async fn sitemaster_busy_omitted_when_reboot_allowed() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.sitemaster = Call::Ok(Sitemaster {
            running: true,
            connected_to_tesla: true,
            power_supply_mode: false,
            can_reboot: "Yes".to_string(),
        });
        let (_, text) = collect(gateway).await?;
        assert!(!has_sample(&text, "sitemaster_busy"));
        assert!(text.contains("powerwall_sitemaster_running 1"));
        Ok(())
    }

    #[tokio::test]
    async fn sitemaster_busy_keeps_the_empty_reason() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.sitemaster = Call::Ok(Sitemaster {
            running: true,
            connected_to_tesla: true,
            power_supply_mode: false,
            can_reboot: String::new(),
        });
        let (_, text) = collect(gateway).await?;
        assert!(text.contains(r#"powerwall_sitemaster_busy{reason=""} 1"#));
        Ok(())
    }

    #[tokio::test]
    async fn zero_frequency_is_suppressed() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.meter_aggregates = Call::Ok(HashMap::from([
            ("site".to_string(), reading(-210.0, 0.0)),
            ("battery".to_string(), reading(20.0, -0.5)),
        ]));
        gateway.meters = HashMap::from([
            ("site".to_string(), Call::Ok(vec![device("STE1")])),
            ("battery".to_string(), Call::Ok(Vec::new())),
        ]);
        let (_, text) = collect(gateway).await?;
        assert!(!text.contains(r#"powerwall_frequency_hz{category="site"}"#));
        assert!(text.contains(r#"powerwall_frequency_hz{category="battery"} -0.5"#));
        // The per-device reading carries a nonzero frequency.
        assert!(has_sample(&text, "dev_frequency_hz"));
        // But power at zero would still be emitted.
        assert!(text.contains(r#"powerwall_instant_power_watts{category="site"} -210"#));
        Ok(())
    }

    #[tokio::test]
    async fn zero_device_frequency_is_suppressed() -> Result {
        let mut gateway = FakeGateway::healthy();
        let mut flat = device("OBB1234567");
        flat.cached_readings.frequency = 0.0;
        gateway.meter_aggregates =
            Call::Ok(HashMap::from([("load".to_string(), reading(334.0, 49.99))]));
        gateway.meters = HashMap::from([("load".to_string(), Call::Ok(vec![flat]))]);
        let (_, text) = collect(gateway).await?;
        assert!(!has_sample(&text, "dev_frequency_hz"));
        assert!(has_sample(&text, "dev_instant_power_watts"));
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_aborts_the_remaining_steps() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.system_status = Call::Transport;
        let (_, text) = collect(gateway).await?;
        // Steps before the failure keep their samples.
        assert!(text.contains("powerwall_charge_ratio 0.55"));
        assert!(has_sample(&text, "sitemaster_running"));
        assert!(has_sample(&text, "problems_detected_count"));
        // The failed step and everything after it are gone.
        assert!(!has_sample(&text, "full_pack_joules"));
        assert!(!has_sample(&text, "battery_info"));
        assert!(!has_sample(&text, "instant_power_watts"));
        assert!(!has_sample(&text, "network_enabled"));
        Ok(())
    }

    #[tokio::test]
    async fn application_failure_only_skips_its_step() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.system_status = Call::Application;
        let (_, text) = collect(gateway).await?;
        assert!(!has_sample(&text, "full_pack_joules"));
        // The later steps still ran.
        assert!(has_sample(&text, "instant_power_watts"));
        assert!(has_sample(&text, "network_enabled"));
        Ok(())
    }

    #[tokio::test]
    async fn meter_details_failure_is_isolated_per_category() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.meters = HashMap::from([
            ("solar".to_string(), Call::Application),
            ("load".to_string(), Call::Ok(vec![device("OBB1234567")])),
        ]);
        let (_, text) = collect(gateway).await?;
        assert!(text.contains(r#"powerwall_instant_power_watts{category="solar"}"#));
        assert!(text.contains(r#"powerwall_instant_power_watts{category="load"}"#));
        assert!(
            !text
                .lines()
                .any(|line| line.starts_with("powerwall_dev_")
                    && line.contains(r#"category="solar""#))
        );
        assert!(
            text.lines()
                .any(|line| line.starts_with("powerwall_dev_instant_power_watts")
                    && line.contains(r#"category="load""#))
        );
        Ok(())
    }

    #[tokio::test]
    async fn meter_details_transport_failure_aborts_the_pass() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.meter_aggregates =
            Call::Ok(HashMap::from([("solar".to_string(), reading(1185.0, 50.01))]));
        gateway.meters = HashMap::from([("solar".to_string(), Call::Transport)]);
        let (_, text) = collect(gateway).await?;
        assert!(!has_sample(&text, "network_enabled"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_problems_list_is_an_explicit_zero() -> Result {
        let (_, text) = collect(FakeGateway::healthy()).await?;
        assert!(text.contains("powerwall_problems_detected_count 0"));
        Ok(())
    }

    #[tokio::test]
    async fn network_details_skipped_without_a_network_name() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.networks = Call::Ok(vec![Network {
            network_name: String::new(),
            interface: "GsmType".to_string(),
            enabled: false,
            active: false,
            primary: false,
            iface_network_info: InterfaceInfo::default(),
        }]);
        let (_, text) = collect(gateway).await?;
        assert!(has_sample(&text, "network_enabled"));
        assert!(!has_sample(&text, "network_state"));
        assert!(!has_sample(&text, "network_signal_strength"));
        Ok(())
    }

    #[tokio::test]
    async fn zero_signal_strength_is_suppressed() -> Result {
        let mut gateway = FakeGateway::healthy();
        gateway.networks = Call::Ok(vec![Network {
            network_name: "ethernet_tesla_internal_default".to_string(),
            interface: "EthType".to_string(),
            enabled: true,
            active: true,
            primary: true,
            iface_network_info: InterfaceInfo {
                network_name: "ethernet_tesla_internal_default".to_string(),
                state: "DeviceStateReady".to_string(),
                state_reason: "DeviceStateReasonNone".to_string(),
                signal_strength: 0,
            },
        }]);
        let (_, text) = collect(gateway).await?;
        assert!(has_sample(&text, "network_state"));
        assert!(!has_sample(&text, "network_signal_strength"));
        Ok(())
    }
}
