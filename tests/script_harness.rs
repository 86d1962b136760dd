use std::fs::File;
use std::path::Path;

use kestrel_scripting::script_harness::{load_fixture, run_fixture, HarnessOutput};

#[test]
fn scene_fixture_matches_golden() {
    assert_fixture_matches(
        "tests/fixtures/script_harness/scene.json",
        "tests/fixtures/script_harness/scene.golden.json",
    );
}

#[test]
fn scene_fixture_is_stable_across_runs() {
    let fixture = load_fixture("tests/fixtures/script_harness/scene.json").expect("load fixture");
    let first = run_fixture(&fixture).expect("run fixture first time");
    let second = run_fixture(&fixture).expect("run fixture second time");
    assert_eq!(first, second, "fixture should produce identical output across runs");
}

#[test]
fn extra_ticks_keep_behaviours_started_once() {
    let mut fixture = load_fixture("tests/fixtures/script_harness/scene.json").expect("load fixture");
    fixture.ticks = 10;
    let output = run_fixture(&fixture).expect("run fixture");
    let starts =
        output.results.iter().flat_map(|result| &result.logs).filter(|line| line.starts_with("door ready")).count();
    assert_eq!(starts, 1);
    assert_eq!(output.final_entities[0].script_data.get("opened").map(String::as_str), Some("10"));
    assert_eq!(output.final_entities[1].script_data.get("steps").map(String::as_str), Some("10"));
}

fn assert_fixture_matches(fixture_path: &str, golden_path: &str) {
    let fixture = load_fixture(fixture_path).expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");
    let golden_file = File::open(Path::new(golden_path)).expect("open golden");
    let golden: HarnessOutput = serde_json::from_reader(golden_file).expect("parse golden");
    assert_eq!(output, golden, "fixture {} diverged from golden {}", fixture_path, golden_path);
}
