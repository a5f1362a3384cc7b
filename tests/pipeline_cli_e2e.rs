#![cfg(all(feature = "cli", any(target_os = "linux", target_os = "macos")))]

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::tempdir;

const CALC: &str = "package a;\nclass Calc {\n  int f(int x) {\n    if (x > 0) {\n      x = x + 1;\n    }\n    return x;\n  }\n}\n";

const CALC_TEST: &str = "package a;\n\nclass CalcTest {\n  @Test\n  void adds() {\n    new Calc().f(1);\n  }\n}\n";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let script = dir.join(name);
    let mut file = File::create(&script).expect("script should be created");
    file.write_all(body.as_bytes())
        .expect("script should be written");
    file.sync_all().expect("script should be flushed");
    fs::set_permissions(&script, PermissionsExt::from_mode(0o755))
        .expect("script should be executable");
    script
}

fn steps_json(lines: &[u32]) -> String {
    let steps: Vec<String> = lines
        .iter()
        .map(|l| format!(r#"{{"location":{{"class":"a.Calc","line":{l}}}}}"#))
        .collect();
    format!(
        r#"{{"step_count":{},"steps":[{}]}}"#,
        lines.len(),
        steps.join(",")
    )
}

/// Project with one class, one test, a copying "compiler" and a launcher that fails
/// whenever the compiled class is not the original one.
fn fake_project(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let project = root.join("project");
    fs::create_dir_all(project.join("src/main/java/a")).expect("main dir should be created");
    fs::create_dir_all(project.join("src/test/java/a")).expect("test dir should be created");
    fs::create_dir_all(project.join("target/classes/a")).expect("classes dir should be created");
    fs::write(project.join("src/main/java/a/Calc.java"), CALC).expect("source should write");
    fs::write(project.join("src/test/java/a/CalcTest.java"), CALC_TEST)
        .expect("test source should write");
    fs::write(project.join("target/classes/a/Calc.class"), "original")
        .expect("class should write");

    let bin = root.join("fake-bin");
    fs::create_dir_all(&bin).expect("fake bin dir should be created");
    let compiler = write_script(
        &bin,
        "fake-javac",
        "#!/usr/bin/env sh\nset -e\n# fake-javac -d <output> <source>\ncp \"$3\" \"$2/a/Calc.class\"\n",
    );
    let launcher = write_script(
        &bin,
        "fake-launcher",
        &format!(
            "#!/usr/bin/env sh\nset -e\nif [ \"$(cat target/classes/a/Calc.class)\" = \"original\" ]; then\n  printf '%s' '{}' > \"$MUTRACE_REPORT\"\n  exit 0\nfi\nprintf '%s' '{}' > \"$MUTRACE_REPORT\"\nexit 1\n",
            steps_json(&[3, 4, 5, 7]),
            steps_json(&[3, 4, 7]),
        ),
    );
    (project, compiler, launcher)
}

fn run_cli(args: &[&str]) -> std::process::Output {
    let binary = PathBuf::from(env!("CARGO_BIN_EXE_mutrace"));
    Command::new(binary)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .expect("cli command should run")
}

fn stdout_line<'a>(text: &'a str, prefix: &str) -> &'a str {
    text.lines()
        .find_map(|line| line.strip_prefix(prefix))
        .expect("output should include the prefixed line")
        .trim()
}

fn summary_count(summary: &str, field: &str) -> usize {
    summary
        .split(", ")
        .find_map(|pair| pair.strip_prefix(&format!("{field}=")))
        .expect("summary should include the field")
        .parse()
        .expect("summary count should be numeric")
}

#[test]
fn e2e_cli_run_localizes_reruns_idempotently_and_reports() {
    let tmp = tempdir().expect("tempdir should be created");
    let (project, compiler, launcher) = fake_project(tmp.path());
    let project_arg = project.to_str().expect("project path should be valid utf-8");
    let compile_arg = format!(
        "{} -d {{output}} {{source}}",
        compiler.to_str().expect("compiler path should be valid utf-8")
    );
    let launcher_arg = launcher.to_str().expect("launcher path should be valid utf-8");
    let run_args = [
        "run",
        "--project",
        project_arg,
        "--compile",
        compile_arg.as_str(),
        "--launcher",
        launcher_arg,
        "--timeout-secs",
        "10",
    ];

    let first = run_cli(&run_args);
    assert!(
        first.status.success(),
        "first run failed: {}",
        String::from_utf8_lossy(&first.stderr)
    );
    let text = String::from_utf8_lossy(&first.stdout).to_string();
    let summary = stdout_line(&text, "summary: ");
    assert_eq!(summary_count(summary, "test_cases"), 1, "{summary}");
    assert_eq!(summary_count(summary, "trials"), 1, "{summary}");
    assert_eq!(summary_count(summary, "errors"), 0, "{summary}");
    let attempted = summary_count(summary, "attempted");
    assert!(attempted > 0, "{summary}");
    assert!(summary_count(summary, "mutants") > attempted, "{summary}");
    assert_eq!(
        fs::read_to_string(project.join("target/classes/a/Calc.class"))
            .expect("class should exist"),
        "original"
    );
    assert!(project.join(".mutrace/runs/ledger.jsonl").is_file());
    assert!(project.join(".mutrace/runs/config.json").is_file());

    let second = run_cli(&run_args);
    assert!(second.status.success());
    let text = String::from_utf8_lossy(&second.stdout).to_string();
    let summary = stdout_line(&text, "summary: ");
    assert_eq!(summary_count(summary, "attempted"), 0, "{summary}");
    assert_eq!(summary_count(summary, "skipped"), attempted, "{summary}");
    assert_eq!(summary_count(summary, "trials"), 0, "{summary}");

    let trials = run_cli(&["trials", "--project", project_arg, "--json"]);
    assert!(trials.status.success());
    let payload: serde_json::Value =
        serde_json::from_slice(&trials.stdout).expect("trials output should be valid JSON");
    let listed = payload["trials"]
        .as_array()
        .expect("trials should be an array");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["key"]["test_case"]["method"], "adds");
    assert_eq!(listed[0]["root_cause"]["line"], 4);
    assert_eq!(listed[0]["original_root_line"], 4);
    assert_eq!(listed[0]["divergence"]["kind"], "missing_step");
    assert_eq!(payload["summary"]["killed"], 1);

    let status = run_cli(&["status", "--project", project_arg]);
    let text = String::from_utf8_lossy(&status.stdout).to_string();
    assert!(text.contains("- runs: 2"), "{text}");
    assert!(text.contains("| killed | 1 |"), "{text}");

    let archived = project.join(".mutrace/runs/traces/project/a.CalcTest_adds");
    let entries: Vec<_> = fs::read_dir(&archived)
        .expect("trace archive should exist")
        .collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn e2e_cli_failing_baseline_is_listed_as_ignored() {
    let tmp = tempdir().expect("tempdir should be created");
    let (project, compiler, _) = fake_project(tmp.path());
    let launcher = write_script(
        &tmp.path().join("fake-bin"),
        "broken-launcher",
        &format!(
            "#!/usr/bin/env sh\nprintf '%s' '{}' > \"$MUTRACE_REPORT\"\nexit 1\n",
            steps_json(&[3])
        ),
    );
    let project_arg = project.to_str().expect("project path should be valid utf-8");
    let compile_arg = format!(
        "{} -d {{output}} {{source}}",
        compiler.to_str().expect("compiler path should be valid utf-8")
    );

    let run = run_cli(&[
        "run",
        "--project",
        project_arg,
        "--compile",
        compile_arg.as_str(),
        "--launcher",
        launcher.to_str().expect("launcher path should be valid utf-8"),
    ]);
    assert!(run.status.success());
    let text = String::from_utf8_lossy(&run.stdout).to_string();
    assert_eq!(summary_count(stdout_line(&text, "summary: "), "mutants"), 0);

    let ignored = run_cli(&["ignored", "--project", project_arg]);
    let text = String::from_utf8_lossy(&ignored.stdout).to_string();
    assert_eq!(text.trim(), "a.CalcTest#adds\tbaseline failure");
}
