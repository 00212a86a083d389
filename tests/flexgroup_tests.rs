use harvest_poller::exporter::prometheus::render_all;
use harvest_poller::matrix::{Matrix, MetricType};
use harvest_poller::plugins::flexgroup::FlexGroup;
use harvest_poller::plugins::PluginEnv;

/// Cooked volume matrix: `(constituent, latency, ops)`; `None` leaves the
/// latency skipped.
fn constituents(rows: &[(&str, Option<f64>, Option<f64>)]) -> Matrix {
    let mut m = Matrix::new("RestPerf", "volume", "volume");
    m.new_metric("read_ops", MetricType::Float64).unwrap();
    m.new_metric("read_latency", MetricType::Float64)
        .unwrap()
        .set_comment("read_ops");
    for (vol, latency, ops) in rows {
        let key = format!("vs1.{vol}");
        let inst = m.new_instance(&key).unwrap();
        inst.set_label("svm", "vs1");
        inst.set_label("volume", *vol);
        inst.set_label("style", "flexgroup_constituent");
        inst.set_label("aggr", "aggr1");
        m.set_value("read_latency", &key, latency.unwrap_or(f64::NAN)).unwrap();
        m.set_value("read_ops", &key, ops.unwrap_or(f64::NAN)).unwrap();
    }
    m
}

fn flexgroup() -> FlexGroup {
    FlexGroup::new(&serde_yaml::Value::Null, &PluginEnv::default()).unwrap()
}

#[test]
fn test_weighted_average_identity() {
    let mut data = constituents(&[
        ("fg__0001", Some(20.0), Some(4.0)),
        ("fg__0002", Some(30.0), Some(6.0)),
        ("fg__0003", Some(40.0), Some(10.0)),
    ]);
    let (out, skips) = flexgroup().aggregate(&mut data).unwrap();
    assert_eq!(skips, 0);
    let fg = &out[0];
    assert_eq!(fg.get_value("read_latency", "vs1.fg"), (33.0, true));
    assert_eq!(fg.get_value("read_ops", "vs1.fg"), (20.0, true));
    let parent = fg.instance("vs1.fg").unwrap();
    assert_eq!(parent.label("volume"), "fg");
    assert_eq!(parent.label("style"), "flexgroup");
    assert!(data.instances().values().all(|i| !i.exportable()));
}

#[test]
fn test_nan_latency_skips_parent_latency_but_ops_still_add() {
    let mut data = constituents(&[
        ("fg__0001", Some(20.0), Some(4.0)),
        ("fg__0002", Some(40.0), Some(10.0)),
        ("fg__0003", None, None),
    ]);
    let (out, skips) = flexgroup().aggregate(&mut data).unwrap();
    let fg = &out[0];
    assert!(fg.value_state("read_latency", "vs1.fg").unwrap().is_skipped());
    assert_eq!(fg.get_value("read_ops", "vs1.fg"), (14.0, true));
    assert_eq!(skips, 1);
}

#[test]
fn test_nan_ops_skips_parent_latency() {
    let mut data = constituents(&[
        ("fg__0001", Some(20.0), Some(4.0)),
        ("fg__0002", Some(40.0), None),
    ]);
    let (out, skips) = flexgroup().aggregate(&mut data).unwrap();
    assert!(out[0].value_state("read_latency", "vs1.fg").unwrap().is_skipped());
    assert_eq!(out[0].get_value("read_ops", "vs1.fg"), (4.0, true));
    assert_eq!(skips, 1);
}

#[test]
fn test_partial_constituent_skips_parent_latency() {
    let mut data = constituents(&[
        ("fg__0001", Some(20.0), Some(4.0)),
        ("fg__0002", Some(40.0), Some(10.0)),
    ]);
    data.instance_mut("vs1.fg__0002").unwrap().set_partial(true);
    let (out, _) = flexgroup().aggregate(&mut data).unwrap();
    assert!(out[0].value_state("read_latency", "vs1.fg").unwrap().is_skipped());
    assert!(out[0].instance("vs1.fg").unwrap().is_partial());
}

#[test]
fn test_include_constituents_keeps_them_exported() {
    let params: serde_yaml::Value = serde_yaml::from_str("include_constituents: true").unwrap();
    let plugin = FlexGroup::new(&params, &PluginEnv::default()).unwrap();
    let mut data = constituents(&[("fg__0001", Some(20.0), Some(4.0))]);
    plugin.aggregate(&mut data).unwrap();
    assert!(data.instance("vs1.fg__0001").unwrap().exportable());
}

#[test]
fn test_constituents_and_parent_share_type_headers() {
    let params: serde_yaml::Value = serde_yaml::from_str("include_constituents: true").unwrap();
    let plugin = FlexGroup::new(&params, &PluginEnv::default()).unwrap();
    let mut data = constituents(&[
        ("fg__0001", Some(20.0), Some(4.0)),
        ("fg__0002", Some(30.0), Some(6.0)),
    ]);
    let (out, _) = plugin.aggregate(&mut data).unwrap();
    let mut matrices = vec![data];
    matrices.extend(out);

    let text = render_all(&matrices);
    for family in ["volume_read_latency", "volume_read_ops"] {
        assert_eq!(text.matches(&format!("# TYPE {family} gauge\n")).count(), 1, "{text}");
    }
    let header = text.find("# TYPE volume_read_latency gauge").unwrap();
    let next = text[header + 1..].find("# TYPE").map_or(text.len(), |i| header + 1 + i);
    let block = &text[header..next];
    assert!(block.contains("volume=\"fg__0001\""));
    assert!(block.contains("volume=\"fg\""));
}
