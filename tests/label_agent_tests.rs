use harvest_poller::matrix::Matrix;
use harvest_poller::plugins::label_agent::LabelAgent;
use harvest_poller::plugins::{Plugin, PluginError};
use harvest_poller::record::ReplayTransport;

fn agent(yaml: &str) -> Result<LabelAgent, PluginError> {
    let params: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    LabelAgent::new(&params)
}

fn matrix(rows: &[(&str, &[(&str, &str)])]) -> Matrix {
    let mut m = Matrix::new("Rest", "volume", "volume");
    for (key, labels) in rows {
        let inst = m.new_instance(key).unwrap();
        for (k, v) in labels.iter() {
            inst.set_label(*k, *v);
        }
    }
    m
}

fn run(agent: &mut LabelAgent, m: &mut Matrix) {
    agent.run(m, &mut ReplayTransport::new()).unwrap();
}

fn exported(m: &Matrix) -> Vec<String> {
    m.instances()
        .iter()
        .filter(|(_, i)| i.exportable())
        .map(|(k, _)| k.clone())
        .collect()
}

#[test]
fn test_replace_regex_with_reordered_groups() {
    let mut a = agent("replace_regex:\n  - A B `^(aaa)_(\\d+)_(\\w+)$` `$3-$2-bbb`\n").unwrap();
    let mut m = matrix(&[("i1", &[("A", "aaa_12345_abcDEF")])]);
    run(&mut a, &mut m);
    assert_eq!(m.instance("i1").unwrap().label("B"), "abcDEF-12345-bbb");
}

#[test]
fn test_include_rules_or_within_kind() {
    let mut a = agent("include_equals:\n  - volume `vol1`\n  - volume `vol3`\n").unwrap();
    let mut m = matrix(&[
        ("a", &[("volume", "vol1")]),
        ("b", &[("volume", "vol2")]),
        ("c", &[("volume", "vol3")]),
        ("d", &[]),
    ]);
    run(&mut a, &mut m);
    assert_eq!(exported(&m), vec!["a", "c"]);
}

#[test]
fn test_absent_label_never_matches_include() {
    let mut a = agent("include_equals:\n  - svm ``\n").unwrap();
    let mut m = matrix(&[("a", &[("svm", "")]), ("b", &[])]);
    run(&mut a, &mut m);
    assert_eq!(exported(&m), vec!["a"]);
}

#[test]
fn test_exclude_wins_over_include() {
    let mut a = agent(
        "include_contains:\n  - volume `vol`\nexclude_regex:\n  - volume `^vol0$`\n",
    )
    .unwrap();
    let mut m = matrix(&[("a", &[("volume", "vol0")]), ("b", &[("volume", "vol1")])]);
    run(&mut a, &mut m);
    assert_eq!(exported(&m), vec!["b"]);
}

#[test]
fn test_malformed_rule_is_dropped() {
    let mut a = agent(
        "split:\n  - node\nreplace_regex:\n  - A B `([` `$1`\njoin:\n  - key `_` svm,volume\n",
    )
    .unwrap();
    assert_eq!(a.rules().len(), 1);
    let mut m = matrix(&[("a", &[("svm", "vs1"), ("volume", "v1")])]);
    run(&mut a, &mut m);
    assert_eq!(m.instance("a").unwrap().label("key"), "vs1_v1");
}

#[test]
fn test_only_malformed_rules_is_an_error() {
    assert!(matches!(
        agent("split:\n  - node\n"),
        Err(PluginError::NoRules { .. })
    ));
}

#[test]
fn test_split_then_value_to_num() {
    let mut a = agent(
        "split:\n  - node `/` ,aggr,plex\nvalue_to_num:\n  - new_status state online ok `0`\n",
    )
    .unwrap();
    let mut m = matrix(&[
        ("a", &[("node", "/aggr1/plex0"), ("state", "online")]),
        ("b", &[("node", "/aggr2/plex0"), ("state", "offline")]),
        ("c", &[("node", "/aggr3/plex0"), ("state", "ok")]),
    ]);
    run(&mut a, &mut m);
    assert_eq!(m.instance("a").unwrap().label("aggr"), "aggr1");
    assert_eq!(m.instance("b").unwrap().label("plex"), "plex0");
    assert_eq!(m.get_value("new_status", "a"), (1.0, true));
    assert_eq!(m.get_value("new_status", "b"), (0.0, true));
    assert_eq!(m.get_value("new_status", "c"), (1.0, true));
    assert_eq!(m.metric("new_status").unwrap().property(), "value_to_num mapping");
}

#[test]
fn test_join_without_sources_keeps_target() {
    let mut a = agent("join:\n  - key `_` a,b\n").unwrap();
    let mut m = matrix(&[("i1", &[("key", "x")]), ("i2", &[("a", "p")]), ("i3", &[])]);
    run(&mut a, &mut m);
    assert_eq!(m.instance("i1").unwrap().label("key"), "x");
    assert_eq!(m.instance("i2").unwrap().label("key"), "p");
    assert!(!m.instance("i3").unwrap().labels().contains_key("key"));
}
