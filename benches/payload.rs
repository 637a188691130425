//! Benchmarks for turning raw characteristic values into published payloads.
//!
//! `decode_assemble_encode` isolates the synchronous path; `cycle` drives a
//! whole relay cycle against the simulated transport and an in-memory broker.

use atc_sensor_relay::broker::memory::MemoryBroker;
use atc_sensor_relay::matcher::{MatchedDevice, ScanOptions};
use atc_sensor_relay::output::json::JsonFormatter;
use atc_sensor_relay::payload::assemble;
use atc_sensor_relay::transport::mock::MockTransport;
use atc_sensor_relay::{
    CycleConfig, DeviceId, Interrupt, MacAddress, MeasurementKind, MeasurementSet,
    PayloadFormatter, Registry, SensorInfo, run_cycle,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::time::Duration;
use tokio::runtime::Runtime;

const TEST_MAC: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0x0C, 0x5B, 0x45]);

/// Raw values as the sensor reports them: 21.5 °C, 45 %, 87 %
const TEMPERATURE: [u8; 2] = 215u16.to_le_bytes();
const HUMIDITY: [u8; 2] = 4500u16.to_le_bytes();
const BATTERY: [u8; 1] = [87];

fn desk() -> MatchedDevice {
    MatchedDevice {
        id: DeviceId::from_address(TEST_MAC),
        info: SensorInfo::new("desk", "temperature/room"),
    }
}

fn bench_decode_assemble_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_assemble_encode");
    let device = desk();
    let formatter = JsonFormatter;

    group.throughput(Throughput::Elements(1));
    group.bench_function("single", |b| {
        b.iter(|| {
            let mut set = MeasurementSet::new(TEST_MAC, device.info.name.as_str());
            set.record(MeasurementKind::Temperature, black_box(&TEMPERATURE))
                .unwrap();
            set.record(MeasurementKind::Humidity, black_box(&HUMIDITY))
                .unwrap();
            set.record(MeasurementKind::Battery, black_box(&BATTERY))
                .unwrap();
            let message = assemble(&set, &device.info).unwrap();
            black_box(formatter.format(&message.payload).unwrap())
        })
    });

    group.finish();
}

fn registry_of(size: usize) -> Registry {
    (0..size)
        .map(|i| {
            let address = MacAddress([0xA4, 0xC1, 0x38, 0x00, (i >> 8) as u8, i as u8]);
            (
                DeviceId::from_address(address),
                SensorInfo::new(format!("sensor {i}"), format!("temperature/{i}")),
            )
        })
        .collect()
}

fn bench_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("cycle");
    let rt = Runtime::new().unwrap();
    let config = CycleConfig {
        scan: ScanOptions {
            duration: Duration::from_secs(5),
            stop_when_complete: true,
        },
        ..CycleConfig::default()
    };

    for size in [1, 10, 100] {
        let registry = registry_of(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &registry, |b, registry| {
            b.iter(|| {
                let transport = MockTransport::from_registry(registry);
                let broker = MemoryBroker::new();
                let report = rt.block_on(run_cycle(
                    &config,
                    registry,
                    &transport,
                    &broker,
                    &Interrupt::new(),
                ));
                black_box(report.unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode_assemble_encode, bench_cycle);
criterion_main!(benches);
