use std::path::Path;
use std::process::{Command, Output};

use image::{Rgb, RgbImage};

fn stratum(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stratum"))
        .args(args)
        .env("RUST_LOG", "info")
        .output()
        .expect("spawn stratum")
}

fn write_card(path: &Path) {
    RgbImage::from_fn(16, 8, |x, y| Rgb([x as u8 * 15, y as u8 * 30, 90]))
        .save(path)
        .unwrap();
}

fn write_history(path: &Path, json: &str) {
    std::fs::write(path, json).unwrap();
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn modules_lists_builtins() {
    let out = stratum(&["modules"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("velvia (v2)"));
    assert!(stdout.contains("saturation (v3)"));
    assert!(stdout.contains("highlight_protection"));
    assert!(stdout.contains("the strength of saturation boost"));
    assert!(stdout.contains("reduce the effect on bright pixels"));
}

#[test]
fn process_reports_step_timings() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    let output = dir.path().join("out/edited.png");
    write_card(&input);

    let out = stratum(&["process", arg(&input), arg(&output), "--no-accel", "--tile", "4"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("secs to load the image"));
    assert!(stderr.contains("pipeline processing took"));
    assert!(stderr.contains("secs to write the image"));
    let edited = image::open(&output).unwrap();
    assert_eq!((edited.width(), edited.height()), (16, 8));
}

#[test]
fn zero_strength_history_leaves_pixels_alone() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    let output = dir.path().join("out.png");
    let history = dir.path().join("history.json");
    write_card(&input);
    write_history(
        &history,
        r#"[{"op":"velvia","params":{"version":2,"values":{"strength":0.0,"bias":1.0}}}]"#,
    );

    let out = stratum(&[
        "process",
        arg(&input),
        arg(&output),
        "--no-accel",
        "--history",
        arg(&history),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let a = image::open(&input).unwrap().into_rgb8();
    let b = image::open(&output).unwrap().into_rgb8();
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        for c in 0..3 {
            assert!((pa.0[c] as i16 - pb.0[c] as i16).abs() <= 1);
        }
    }
}

#[test]
fn migrate_upgrades_and_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let history = dir.path().join("history.json");
    write_history(
        &history,
        r#"[
            {"op":"saturation","params":{"version":1,"values":{"factor":1.5}}},
            {"op":"velvia","enabled":false,"params":{"version":9,"values":{}}},
            {"op":"sharpen","params":{"version":1,"values":{"amount":2.0}}}
        ]"#,
    );

    let out = stratum(&["migrate", arg(&history)]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let upgraded: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let items = upgraded.as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["params"]["version"], 3);
    assert_eq!(items[0]["params"]["values"]["saturation"], 50.0);
    assert_eq!(items[1]["params"]["version"], 2);
    assert_eq!(items[1]["enabled"], false);
    assert_eq!(items[2]["op"], "sharpen");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("velvia: version 9 params unusable"));
    assert!(stderr.contains("sharpen: unknown module"));
}

#[test]
fn missing_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = stratum(&[
        "process",
        arg(&dir.path().join("absent.png")),
        arg(&dir.path().join("out.png")),
        "--no-accel",
    ]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("absent.png"));
}
