use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(author, version, about = "pipex differential test harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the differential suite against a pipex binary (default)
    Tests {
        /// Only run scenarios whose description contains this filter
        #[arg(short, long)]
        filter: Option<String>,
        /// Print per-scenario execution details
        #[arg(short, long, default_value_t = false)]
        verbose: bool,
        /// Path to the pipex binary under test
        #[arg(short, long, default_value = "../pipex")]
        candidate: PathBuf,
    },
    /// Print the scenario catalog without running anything
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tests {
        filter: None,
        verbose: false,
        candidate: PathBuf::from("../pipex"),
    });

    match command {
        Commands::Tests {
            filter,
            verbose,
            candidate,
        } => {
            VERBOSE.store(verbose, Ordering::Relaxed);
            run_tests(filter, &candidate)
        }
        Commands::List => list_scenarios(),
    }
}

// --------------------- Shared harness --------------------------------------
struct Harness {
    candidate: PathBuf,
    shell: PathBuf,
    workspace: Workspace,
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// A hanging candidate would otherwise hang the whole suite; exceeding the
/// limit is an infrastructure failure, not a comparison result.
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(10);

impl Harness {
    fn new(candidate: &Path) -> Result<Self> {
        ensure_candidate_built(candidate)?;
        let candidate = candidate
            .canonicalize()
            .with_context(|| format!("resolving candidate path {candidate:?}"))?;
        let shell = which::which("bash").context("system bash not found")?;
        let workspace = Workspace::new()?;

        Ok(Self {
            candidate,
            shell,
            workspace,
        })
    }

    /// Both invocations must observe the same pristine fixture state, so the
    /// scratch directory is rebuilt before each one, never reused.
    fn run_scenario(&self, scenario: &Scenario) -> Result<Vec<Discrepancy>> {
        let scratch = self.workspace.reset()?;
        let reference = self.run_reference(scenario, scratch.path())?;
        drop(scratch);

        let scratch = self.workspace.reset()?;
        let candidate = self.run_candidate(scenario, scratch.path())?;
        drop(scratch);

        Ok(compare_runs(&reference, &candidate))
    }

    fn run_reference(&self, scenario: &Scenario, dir: &Path) -> Result<RunOutcome> {
        let pipeline = format!(
            "< {} {} | {} > {}",
            scenario.infile, scenario.cmd1, scenario.cmd2, scenario.outfile
        );
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(&pipeline).current_dir(dir);
        scenario.path.apply(&mut command);
        let result = run_captured(command, INVOCATION_TIMEOUT)
            .with_context(|| format!("reference pipeline `{pipeline}`"))?;

        Ok(RunOutcome {
            result,
            outfile: read_outfile(dir, &scenario.outfile)?,
        })
    }

    fn run_candidate(&self, scenario: &Scenario, dir: &Path) -> Result<RunOutcome> {
        let mut command = Command::new(&self.candidate);
        command
            .arg(&scenario.infile)
            .arg(&scenario.cmd1)
            .arg(&scenario.cmd2)
            .arg(&scenario.outfile)
            .current_dir(dir);
        scenario.path.apply(&mut command);
        let result = run_captured(command, INVOCATION_TIMEOUT)
            .with_context(|| format!("candidate run for `{}`", scenario.description))?;

        Ok(RunOutcome {
            result,
            outfile: read_outfile(dir, &scenario.outfile)?,
        })
    }
}

// --------------------- Scenario catalog ------------------------------------
/// Empty and unset PATH are distinct states and must stay distinct all the
/// way into the child environment.
#[derive(Clone, Debug)]
enum PathPolicy {
    Inherit,
    Empty,
    Unset,
    Value(String),
}

impl PathPolicy {
    fn apply(&self, command: &mut Command) {
        match self {
            PathPolicy::Inherit => {}
            PathPolicy::Empty => {
                command.env("PATH", "");
            }
            PathPolicy::Unset => {
                command.env_remove("PATH");
            }
            PathPolicy::Value(path) => {
                command.env("PATH", path);
            }
        }
    }
}

#[derive(Clone, Debug)]
struct Scenario {
    infile: String,
    cmd1: String,
    cmd2: String,
    outfile: String,
    description: &'static str,
    path: PathPolicy,
}

impl Scenario {
    fn new(params: [&str; 4], description: &'static str) -> Self {
        Self::with_path(params, description, PathPolicy::Inherit)
    }

    fn with_path(params: [&str; 4], description: &'static str, path: PathPolicy) -> Self {
        let [infile, cmd1, cmd2, outfile] = params;
        Self {
            infile: infile.to_string(),
            cmd1: cmd1.to_string(),
            cmd2: cmd2.to_string(),
            outfile: outfile.to_string(),
            description,
            path,
        }
    }
}

fn catalog(template: &Path) -> Result<Vec<Scenario>> {
    let script_abs = template.join("script.sh");
    let script_abs = script_abs
        .to_str()
        .with_context(|| format!("template path {script_abs:?} is not valid UTF-8"))?;
    let inherited = std::env::var("PATH").unwrap_or_default();
    let template_first = format!("{}:{inherited}", template.display());
    let trailing_slashes = inherited
        .split(':')
        .map(|entry| format!("{entry}/"))
        .collect::<Vec<_>>()
        .join(":");

    Ok(vec![
        Scenario::new(
            ["infile.txt", "cat", "wc", "outfile.txt"],
            "normal parameters, simple commands",
        ),
        Scenario::new(
            ["infile.txt", "cat", "wc", "inexistent.txt"],
            "output file does not exist beforehand",
        ),
        Scenario::new(
            ["infile.txt", "sed 's/And/But/'", "grep But", "outfile.txt"],
            "commands with arguments",
        ),
        Scenario::new(
            ["infile.txt", "./script.sh", "wc", "outfile.txt"],
            "command living in the working directory",
        ),
        Scenario::new(
            ["infile.txt", script_abs, "wc", "outfile.txt"],
            "command given as a complete path",
        ),
        Scenario::new(
            ["no_in", "cat", "wc", "outfile.txt"],
            "input file does not exist",
        ),
        Scenario::new(
            ["infile.txt", "non_existent_comm", "wc", "outfile.txt"],
            "first command does not exist",
        ),
        Scenario::new(
            ["infile.txt", "cat", "non_existent_comm", "outfile.txt"],
            "second command does not exist",
        ),
        Scenario::new(
            ["no_r_perm", "cat", "wc", "outfile.txt"],
            "input file without read permission",
        ),
        Scenario::new(
            ["infile.txt", "cat", "wc", "no_w_perm"],
            "output file without write permission",
        ),
        Scenario::new(
            ["infile.txt", "./no_x_script.sh", "wc", "outfile.txt"],
            "first command without execute permission",
        ),
        Scenario::new(
            ["infile.txt", "cat", "./no_x_script.sh", "outfile.txt"],
            "second command without execute permission",
        ),
        Scenario::new(
            ["infile.txt", "./middle_fail.sh", "wc", "outfile.txt"],
            "first command fails mid-stream with partial output",
        ),
        Scenario::new(
            ["infile.txt", "cat", "./middle_fail.sh", "outfile.txt"],
            "second command fails mid-stream with partial output",
        ),
        Scenario::with_path(
            ["infile.txt", "./script.sh", "./script.sh", "outfile.txt"],
            "empty PATH with local scripts",
            PathPolicy::Empty,
        ),
        Scenario::with_path(
            ["infile.txt", "cat", "wc", "outfile.txt"],
            "empty PATH with bare command names",
            PathPolicy::Empty,
        ),
        Scenario::with_path(
            ["infile.txt", "./script.sh", "./script.sh", "outfile.txt"],
            "unset PATH with local scripts",
            PathPolicy::Unset,
        ),
        Scenario::with_path(
            ["infile.txt", "cat", "wc", "outfile.txt"],
            "unset PATH with bare command names",
            PathPolicy::Unset,
        ),
        Scenario::new(
            ["infile.txt", "cat", "script.sh", "outfile.txt"],
            "local script name without ./ must not resolve",
        ),
        Scenario::with_path(
            ["infile.txt", "cat", "uname", "outfile.txt"],
            "PATH entries are searched in order",
            PathPolicy::Value(template_first),
        ),
        Scenario::with_path(
            ["infile.txt", "cat", "wc", "outfile.txt"],
            "short PATH without /usr/bin",
            PathPolicy::Value("/bin".to_string()),
        ),
        Scenario::with_path(
            ["infile.txt", "cat", "wc", "outfile.txt"],
            "PATH entries carry trailing slashes",
            PathPolicy::Value(trailing_slashes),
        ),
        Scenario::new(
            ["binary.bin", "cat", "cat", "outfile.txt"],
            "binary data flows through the pipe untouched",
        ),
    ])
}

// --------------------- Fixtures --------------------------------------------
/// Permission bits each fixture must carry in the scratch directory. Applied
/// after copying so the template itself stays readable.
const FIXTURE_MODES: &[(&str, u32)] = &[
    ("no_r_perm", 0o200),
    ("no_w_perm", 0o444),
    ("script.sh", 0o755),
    ("no_x_script.sh", 0o644),
    ("middle_fail.sh", 0o755),
    ("uname", 0o755),
];

struct Workspace {
    root: TempDir,
    template: PathBuf,
}

impl Workspace {
    fn new() -> Result<Self> {
        let root = TempDir::new().context("creating workspace root")?;
        let template = root.path().join("template");
        fs::create_dir(&template).context("creating fixture template dir")?;
        populate_template(&template)?;

        Ok(Self { root, template })
    }

    /// Builds a fresh uniquely-named scratch directory holding a pristine
    /// copy of every fixture. The returned handle owns the directory and
    /// cleans it up on drop.
    fn reset(&self) -> Result<TempDir> {
        let scratch = TempDir::new_in(self.root.path()).context("creating scratch dir")?;
        for entry in WalkDir::new(&self.template).min_depth(1) {
            let entry = entry.context("walking fixture template")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let dest = scratch.path().join(entry.file_name());
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copying fixture {:?}", entry.file_name()))?;
        }
        for (name, mode) in FIXTURE_MODES {
            let path = scratch.path().join(name);
            fs::set_permissions(&path, fs::Permissions::from_mode(*mode))
                .with_context(|| format!("setting mode {mode:o} on {name}"))?;
        }
        Ok(scratch)
    }
}

fn populate_template(template: &Path) -> Result<()> {
    let p = |name: &str| template.join(name);

    fs::write(
        p("infile.txt"),
        b"And the harness begins\nplain middle line\nAnd a second marker\nnothing to replace here\nAnd the closing line\n",
    )?;
    fs::write(p("outfile.txt"), b"stale content from an earlier run\n")?;
    fs::write(p("no_r_perm"), b"you should never manage to read this\n")?;
    fs::write(p("no_w_perm"), b"read-only output target\n")?;
    // Shell builtins only, so the script keeps working when a scenario
    // empties or removes PATH.
    let script = b"#!/bin/sh\nwhile IFS= read -r line; do\n\techo \"marked: $line\"\ndone\n";
    fs::write(p("script.sh"), script)?;
    fs::write(p("no_x_script.sh"), script)?;
    fs::write(
        p("middle_fail.sh"),
        b"#!/bin/sh\necho partial output before the failure\necho giving up now >&2\nexit 12\n",
    )?;
    fs::write(p("uname"), b"#!/bin/sh\necho pipex-tester-shadow\n")?;
    let mut binary = vec![0u8; 512];
    rand::thread_rng().fill_bytes(&mut binary);
    fs::write(p("binary.bin"), &binary)?;

    // The complete-path and PATH-order scenarios execute scripts straight out
    // of the template, so the exec bits must exist there as well.
    for (name, mode) in FIXTURE_MODES {
        if mode & 0o100 != 0 {
            fs::set_permissions(p(name), fs::Permissions::from_mode(*mode))
                .with_context(|| format!("marking template {name} executable"))?;
        }
    }
    Ok(())
}

// --------------------- Dual invoker ----------------------------------------
#[derive(Clone, Debug)]
struct ExecutionResult {
    stdout: String,
    stderr: String,
    code: Option<i32>,
    escaped: bool,
}

#[derive(Clone, Debug)]
struct RunOutcome {
    result: ExecutionResult,
    outfile: Option<Vec<u8>>,
}

fn run_captured(mut command: Command, timeout: Duration) -> Result<ExecutionResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let label = format!("{:?}", command.get_program());
    let mut child = command
        .spawn()
        .with_context(|| format!("spawning {label}"))?;

    let stdout_thread = drain(child.stdout.take().unwrap());
    let stderr_thread = drain(child.stderr.take().unwrap());
    let status = wait_with_deadline(&mut child, timeout)?;
    let stdout_bytes = stdout_thread.join().unwrap()?;
    let stderr_bytes = stderr_thread.join().unwrap()?;

    let (stdout, escaped_out) = capture_as_text(&stdout_bytes);
    let (stderr, escaped_err) = capture_as_text(&stderr_bytes);
    let result = ExecutionResult {
        stdout,
        stderr,
        code: status.code(),
        escaped: escaped_out || escaped_err,
    };
    if VERBOSE.load(Ordering::Relaxed) {
        println!(
            "[CMD ] {label} -> status {:?}, stdout {}B, stderr {}B{}",
            result.code,
            result.stdout.len(),
            result.stderr.len(),
            if result.escaped { " (escaped bytes)" } else { "" }
        );
    }
    Ok(result)
}

fn drain<R: Read + Send + 'static>(
    mut pipe: R,
) -> std::thread::JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            bail!("process still running after {}s, killed", timeout.as_secs());
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Permissive capture: ASCII passes through, every other byte becomes a
/// visible \xNN escape and sets the flag. Never fails, whatever the commands
/// emit.
fn capture_as_text(bytes: &[u8]) -> (String, bool) {
    let mut text = String::with_capacity(bytes.len());
    let mut escaped = false;
    for &byte in bytes {
        if byte.is_ascii() {
            text.push(byte as char);
        } else {
            text.push_str(&format!("\\x{byte:02x}"));
            escaped = true;
        }
    }
    (text, escaped)
}

/// The output file may or may not exist after a run; absence is a value to
/// compare, not an error. Any other read failure is the harness's own
/// problem and aborts the scenario.
fn read_outfile(dir: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    match fs::read(dir.join(name)) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading result file {name}")),
    }
}

// --------------------- Output comparator -----------------------------------
#[derive(Clone, Debug, PartialEq)]
struct Discrepancy {
    channel: &'static str,
    reference: String,
    candidate: String,
}

/// All four channels are checked independently; the first mismatch never
/// hides the others.
fn compare_runs(reference: &RunOutcome, candidate: &RunOutcome) -> Vec<Discrepancy> {
    let mut problems = Vec::new();
    if reference.result.stdout != candidate.result.stdout {
        problems.push(Discrepancy {
            channel: "stdout",
            reference: reference.result.stdout.clone(),
            candidate: candidate.result.stdout.clone(),
        });
    }
    // Error wording is implementation-defined; only the shape has to match.
    if reference.result.stderr.lines().count() != candidate.result.stderr.lines().count() {
        problems.push(Discrepancy {
            channel: "stderr",
            reference: reference.result.stderr.clone(),
            candidate: candidate.result.stderr.clone(),
        });
    }
    if reference.result.code != candidate.result.code {
        problems.push(Discrepancy {
            channel: "exit code",
            reference: render_code(reference.result.code),
            candidate: render_code(candidate.result.code),
        });
    }
    if reference.outfile != candidate.outfile {
        problems.push(Discrepancy {
            channel: "outfile",
            reference: render_outfile(&reference.outfile),
            candidate: render_outfile(&candidate.outfile),
        });
    }
    problems
}

fn render_code(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}

fn render_outfile(content: &Option<Vec<u8>>) -> String {
    match content {
        Some(bytes) => capture_as_text(bytes).0,
        None => "<no readable output file>".to_string(),
    }
}

// --------------------- Test runner -----------------------------------------
fn run_tests(filter: Option<String>, candidate: &Path) -> Result<()> {
    let harness = Harness::new(candidate)?;
    let scenarios = catalog(&harness.workspace.template)?;

    let total = scenarios.len();
    let mut passed = 0usize;
    let mut broken = 0usize;
    for scenario in &scenarios {
        if let Some(f) = &filter {
            if !scenario.description.contains(f) {
                continue;
            }
        }
        if VERBOSE.load(Ordering::Relaxed) {
            println!("[RUN ] {}", scenario.description);
        }
        match harness.run_scenario(scenario) {
            Ok(problems) if problems.is_empty() => {
                passed += 1;
                println!("[PASS] {}", scenario.description);
            }
            Ok(problems) => {
                println!("[FAIL] {}", scenario.description);
                for problem in &problems {
                    report_discrepancy(problem);
                }
            }
            Err(e) => {
                broken += 1;
                println!("[ERR ] {}: {e:#}", scenario.description);
            }
        }
    }
    println!(
        "\n{passed}/{total} scenarios passed{}.",
        if filter.is_some() { " (filtered)" } else { "" }
    );
    if broken > 0 {
        bail!("{broken} scenario(s) hit infrastructure errors");
    }
    if passed == total || filter.is_some() {
        return Ok(());
    }
    bail!("behavior differences encountered");
}

fn report_discrepancy(problem: &Discrepancy) {
    println!(
        "  {} differs\n  === reference ===\n{}\n  === candidate ===\n{}",
        problem.channel, problem.reference, problem.candidate
    );
}

fn list_scenarios() -> Result<()> {
    let workspace = Workspace::new()?;
    for (idx, scenario) in catalog(&workspace.template)?.iter().enumerate() {
        println!(
            "{:2}. {} [< {} {} | {} > {}] PATH={:?}",
            idx + 1,
            scenario.description,
            scenario.infile,
            scenario.cmd1,
            scenario.cmd2,
            scenario.outfile,
            scenario.path
        );
    }
    Ok(())
}

// --------------------- Helpers ---------------------------------------------
fn ensure_candidate_built(candidate: &Path) -> Result<()> {
    if candidate.exists() {
        return Ok(());
    }
    let dir = candidate
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    println!("[build] running make in {}", dir.display());
    let mut make = Command::new("make");
    make.current_dir(dir);
    run_status(make)?;
    if !candidate.exists() {
        bail!("candidate binary {candidate:?} still missing after make");
    }
    Ok(())
}

fn run_status(mut cmd: Command) -> Result<()> {
    let status = cmd.status()?;
    if !status.success() {
        bail!("command failed: {:?}", cmd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashSet};

    fn outcome(stdout: &str, stderr: &str, code: i32, outfile: Option<&[u8]>) -> RunOutcome {
        RunOutcome {
            result: ExecutionResult {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                code: Some(code),
                escaped: false,
            },
            outfile: outfile.map(|bytes| bytes.to_vec()),
        }
    }

    #[test]
    fn capture_keeps_ascii() {
        let (text, escaped) = capture_as_text(b"plain text\twith\ttabs\n");
        assert_eq!(text, "plain text\twith\ttabs\n");
        assert!(!escaped);
    }

    #[test]
    fn capture_escapes_high_bytes() {
        let (text, escaped) = capture_as_text(&[b'a', 0xff, 0x80, b'\n']);
        assert_eq!(text, "a\\xff\\x80\n");
        assert!(escaped);
    }

    #[test]
    fn identical_runs_produce_no_discrepancies() {
        let reference = outcome("out\n", "err\n", 0, Some(b"file"));
        let candidate = outcome("out\n", "err\n", 0, Some(b"file"));
        assert!(compare_runs(&reference, &candidate).is_empty());
    }

    #[test]
    fn each_channel_reported_independently() {
        let reference = outcome("out\n", "one line\n", 0, Some(b"file"));
        let candidate = outcome("other\n", "", 1, Some(b"different"));
        let problems = compare_runs(&reference, &candidate);
        let channels: Vec<_> = problems.iter().map(|p| p.channel).collect();
        assert_eq!(channels, ["stdout", "stderr", "exit code", "outfile"]);
    }

    #[test]
    fn stderr_wording_is_free_but_shape_is_not() {
        let reference = outcome("", "bash: no_in: No such file or directory\n", 1, None);
        let same_shape = outcome("", "pipex: cannot open no_in\n", 1, None);
        assert!(compare_runs(&reference, &same_shape).is_empty());

        let extra_line = outcome("", "pipex: cannot open no_in\nusage: pipex ...\n", 1, None);
        let problems = compare_runs(&reference, &extra_line);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].channel, "stderr");
    }

    #[test]
    fn missing_outfile_on_one_side_is_a_divergence() {
        let reference = outcome("", "", 0, Some(b"content"));
        let candidate = outcome("", "", 0, None);
        let problems = compare_runs(&reference, &candidate);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].channel, "outfile");

        let neither = outcome("", "", 1, None);
        assert!(compare_runs(&neither, &neither.clone()).is_empty());
    }

    #[test]
    fn comparator_is_pure() {
        let reference = outcome("a\n", "x\n", 0, Some(b"one"));
        let candidate = outcome("b\n", "", 2, Some(b"two"));
        assert_eq!(
            compare_runs(&reference, &candidate),
            compare_runs(&reference, &candidate)
        );
    }

    fn probe_path(policy: &PathPolicy) -> Option<String> {
        // A shell would install its own default PATH, so probe with env,
        // which dumps the environment verbatim.
        let env_bin = which::which("env").expect("env binary");
        let mut cmd = Command::new(env_bin);
        policy.apply(&mut cmd);
        let out = cmd.output().expect("running env probe");
        let text = String::from_utf8_lossy(&out.stdout).into_owned();
        text.lines()
            .find_map(|line| line.strip_prefix("PATH=").map(str::to_string))
    }

    #[test]
    fn path_policy_states_stay_distinct() {
        assert_eq!(probe_path(&PathPolicy::Empty), Some(String::new()));
        assert_eq!(probe_path(&PathPolicy::Unset), None);
        assert_eq!(
            probe_path(&PathPolicy::Value("/bin".to_string())),
            Some("/bin".to_string())
        );
        let inherited = std::env::var("PATH").expect("test environment has PATH");
        assert_eq!(probe_path(&PathPolicy::Inherit), Some(inherited));
    }

    fn snapshot(dir: &Path) -> BTreeMap<String, (u32, Option<Vec<u8>>)> {
        let mut map = BTreeMap::new();
        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = entry.expect("walking scratch dir");
            if !entry.file_type().is_file() {
                continue;
            }
            let mode = entry.metadata().expect("metadata").permissions().mode() & 0o777;
            // Unreadable fixtures are compared by mode alone so the result
            // does not depend on who runs the tests.
            let bytes = if mode & 0o400 != 0 {
                Some(fs::read(entry.path()).expect("readable fixture"))
            } else {
                None
            };
            map.insert(
                entry.file_name().to_string_lossy().into_owned(),
                (mode, bytes),
            );
        }
        map
    }

    #[test]
    fn reset_is_idempotent() {
        let workspace = Workspace::new().expect("workspace");
        let first = workspace.reset().expect("first reset");
        let second = workspace.reset().expect("second reset");
        assert_eq!(snapshot(first.path()), snapshot(second.path()));
    }

    #[test]
    fn reset_applies_fixture_modes() {
        let workspace = Workspace::new().expect("workspace");
        let scratch = workspace.reset().expect("reset");
        for (name, mode) in FIXTURE_MODES {
            let meta = fs::metadata(scratch.path().join(name)).expect("fixture present");
            assert_eq!(meta.permissions().mode() & 0o777, *mode, "{name}");
        }
    }

    #[test]
    fn catalog_rejects_non_utf8_template_path() {
        use std::os::unix::ffi::OsStrExt;
        let bogus = PathBuf::from(std::ffi::OsStr::from_bytes(b"/tmp/fixt\xff\xfeures"));
        assert!(catalog(&bogus).is_err());
    }

    #[test]
    fn catalog_is_well_formed() {
        let workspace = Workspace::new().expect("workspace");
        let scenarios = catalog(&workspace.template).expect("catalog");
        assert_eq!(scenarios.len(), 23);
        let mut seen = HashSet::new();
        for scenario in &scenarios {
            assert!(!scenario.infile.is_empty());
            assert!(!scenario.cmd1.is_empty());
            assert!(!scenario.cmd2.is_empty());
            assert!(!scenario.outfile.is_empty());
            assert!(
                seen.insert(scenario.description),
                "duplicate description {}",
                scenario.description
            );
        }
    }

    #[test]
    fn hung_process_is_killed_and_reported_as_infrastructure() {
        let sleep_bin = which::which("sleep").expect("sleep binary");
        let mut cmd = Command::new(sleep_bin);
        cmd.arg("5");
        let err = run_captured(cmd, Duration::from_millis(100))
            .expect_err("hung process must not yield a comparison result");
        assert!(err.to_string().contains("still running"), "{err:#}");
    }

    #[test]
    fn outfile_reads_as_value_or_absence() {
        let dir = TempDir::new().expect("temp dir");
        assert_eq!(read_outfile(dir.path(), "absent.txt").expect("absent"), None);
        fs::write(dir.path().join("present.txt"), b"content").expect("write");
        assert_eq!(
            read_outfile(dir.path(), "present.txt").expect("present"),
            Some(b"content".to_vec())
        );
    }

    #[test]
    fn unreadable_result_file_is_an_infrastructure_error() {
        // A directory in place of the result file fails the read for a
        // reason other than absence, whoever runs the suite.
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir(dir.path().join("result_dir")).expect("mkdir");
        assert!(read_outfile(dir.path(), "result_dir").is_err());
    }
}
