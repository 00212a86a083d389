use harvest_poller::matrix::{Matrix, MetricType};
use harvest_poller::plugins::sensor::{Sensor, CHASSIS_FRU_QUERY};
use harvest_poller::plugins::Plugin;
use harvest_poller::record::{Record, ReplayTransport};
use serde_json::json;

fn sensors(rows: &[(&str, &str, &str, &str, f64)]) -> Matrix {
    let mut m = Matrix::new("Rest", "sensor", "sensor");
    m.set_global_label("cluster", "c1");
    m.new_metric("value", MetricType::Float64).unwrap();
    for (i, (node, name, kind, unit, value)) in rows.iter().enumerate() {
        let key = format!("{node}.{i:02}");
        let inst = m.new_instance(&key).unwrap();
        inst.set_label("node", *node);
        inst.set_label("sensor", *name);
        inst.set_label("type", *kind);
        inst.set_label("unit", *unit);
        m.set_value("value", &key, *value).unwrap();
    }
    m
}

fn run(data: &mut Matrix, transport: &mut ReplayTransport) -> Matrix {
    let mut plugin = Sensor::new(&serde_yaml::Value::Null).unwrap();
    let mut out = plugin.run(data, transport).unwrap();
    assert_eq!(out.matrices.len(), 1);
    out.matrices.remove(0)
}

fn close(actual: (f64, bool), expected: f64) {
    assert!(actual.1, "value missing");
    assert!((actual.0 - expected).abs() < 0.01, "{} != {}", actual.0, expected);
}

#[test]
fn test_output_side_psus_apply_efficiency() {
    let mut data = sensors(&[
        ("n1", "PSU1 12V", "voltage", "V", 12.0),
        ("n1", "PSU1 12V Curr", "current", "A", 10.0),
        ("n1", "PSU2 12V", "voltage", "V", 12.0),
        ("n1", "PSU2 12V Curr", "current", "A", 10.0),
    ]);
    let out = run(&mut data, &mut ReplayTransport::new());
    assert_eq!(out.object(), "environment_sensor");
    assert_eq!(out.global_labels().get("cluster").map(String::as_str), Some("c1"));
    close(out.get_value("power", "n1"), 258.06);
}

#[test]
fn test_mixed_rails_pair_in_order() {
    let mut data = sensors(&[
        ("n1", "PSU1 12V", "voltage", "V", 12.0),
        ("n1", "PSU1 12V Curr", "current", "A", 10.0),
        ("n1", "PSU2 5V", "voltage", "V", 5.0),
        ("n1", "PSU2 5V Curr", "current", "A", 2.0),
    ]);
    let out = run(&mut data, &mut ReplayTransport::new());
    close(out.get_value("power", "n1"), 139.78);
}

#[test]
fn test_shared_psus_split_power_between_nodes() {
    let mut data = sensors(&[
        ("n1", "PSU1 InPower", "unknown", "W", 300.0),
        ("n2", "PSU1 InPower", "unknown", "W", 300.0),
        ("n3", "PSU1 InPower", "unknown", "W", 300.0),
    ]);
    let mut transport = ReplayTransport::new();
    transport.insert(
        CHASSIS_FRU_QUERY,
        vec![
            Record::new(json!({"fru_name": "PSU1", "type": "psu", "connected_nodes": ["n1", "n2"], "num_nodes": 2})),
            Record::new(json!({"fru_name": "PSU9", "type": "psu"})),
        ],
    );
    let out = run(&mut data, &mut transport);
    assert_eq!(out.get_value("power", "n1"), (150.0, true));
    assert_eq!(out.get_value("power", "n2"), (150.0, true));
    assert_eq!(out.get_value("power", "n3"), (300.0, true));
    assert!(transport.requests()[0].starts_with(CHASSIS_FRU_QUERY));
}

#[test]
fn test_thermal_exclusions() {
    let mut data = sensors(&[
        ("n1", "CPU0 Temp", "thermal", "C", 60.0),
        ("n1", "CPU0 Temp Margin", "thermal", "C", 20.0),
        ("n1", "Cold Sensor", "thermal", "C", 0.0),
        ("n1", "Ambient Temp", "thermal", "C", 21.0),
    ]);
    let out = run(&mut data, &mut ReplayTransport::new());
    assert_eq!(out.get_value("average_temperature", "n1"), (60.0, true));
    assert_eq!(out.get_value("min_temperature", "n1"), (60.0, true));
    assert_eq!(out.get_value("max_temperature", "n1"), (60.0, true));
    assert_eq!(out.get_value("average_ambient_temperature", "n1"), (21.0, true));
    assert_eq!(out.get_value("power", "n1"), (0.0, false));
}

#[test]
fn test_matrix_is_rebuilt_every_poll() {
    let mut plugin = Sensor::new(&serde_yaml::Value::Null).unwrap();
    let mut transport = ReplayTransport::new();

    let mut first = sensors(&[("n1", "Fan1", "fan", "RPM", 3000.0)]);
    plugin.run(&mut first, &mut transport).unwrap();

    let mut second = sensors(&[("n2", "Fan1", "fan", "RPM", 4000.0)]);
    let out = plugin.run(&mut second, &mut transport).unwrap();
    let env = &out.matrices[0];
    assert!(env.instance("n1").is_none());
    assert_eq!(env.get_value("max_fan_speed", "n2"), (4000.0, true));
}
