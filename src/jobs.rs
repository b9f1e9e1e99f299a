//! OCR-D job descriptors and process status
//!
//! The controller leaves one `KEY=VALUE` file per job in the job directory. A job
//! with a `PID` but no `RETURN_CODE` is running; its process group is queried
//! with `ps`, locally or over ssh.

use crate::config::ControllerConfig;
use chrono::{DateTime, NaiveDateTime};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Output columns requested from `ps`
const PS_FORMAT: &str = "pid=,state=,%cpu=,rss=,cputime=";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JobParseError {
    #[error("line {line}: expected KEY=VALUE, got '{content}'")]
    MalformedLine { line: usize, content: String },

    #[error("missing required key {0}")]
    MissingKey(&'static str),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// One job descriptor file
#[derive(Debug, Clone, PartialEq)]
pub struct OcrdJob {
    pub process_id: u64,
    pub task_id: u64,
    pub process_dir: PathBuf,
    pub workdir: PathBuf,
    pub workflow: PathBuf,
    pub controller_address: String,
    pub pid: Option<u32>,
    pub return_code: Option<i32>,
    pub time_created: Option<String>,
    pub time_terminated: Option<String>,
}

impl OcrdJob {
    pub fn is_running(&self) -> bool {
        self.pid.is_some() && self.return_code.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.return_code.is_some()
    }

    /// Workflow file name without directories
    pub fn workflow_name(&self) -> String {
        self.workflow
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.time_created.as_deref().and_then(parse_time)
    }
}

impl FromStr for OcrdJob {
    type Err = JobParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut values = HashMap::new();
        for (index, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| JobParseError::MalformedLine {
                    line: index + 1,
                    content: line.to_string(),
                })?;
            values.insert(key.trim(), value.trim());
        }

        let optional = |key: &'static str| values.get(key).copied().filter(|v| !v.is_empty());
        let required = |key: &'static str| optional(key).ok_or(JobParseError::MissingKey(key));

        Ok(Self {
            process_id: parse_value("PROCESS_ID", required("PROCESS_ID")?)?,
            task_id: parse_value("TASK_ID", required("TASK_ID")?)?,
            process_dir: PathBuf::from(required("PROCESS_DIR")?),
            workdir: PathBuf::from(required("WORKDIR")?),
            workflow: PathBuf::from(required("WORKFLOW")?),
            controller_address: required("CONTROLLER")?.to_string(),
            pid: optional("PID").map(|v| parse_value("PID", v)).transpose()?,
            return_code: optional("RETURN_CODE")
                .map(|v| parse_value("RETURN_CODE", v))
                .transpose()?,
            time_created: optional("TIME_CREATED").map(str::to_string),
            time_terminated: optional("TIME_TERMINATED").map(str::to_string),
        })
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, JobParseError> {
    value.parse().map_err(|_| JobParseError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_time(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.naive_local())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").ok())
        .or_else(|| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").ok())
}

/// Scheduler state reported by `ps`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    UninterruptibleSleep,
    Stopped,
    Idle,
    Zombie,
    Unknown(char),
}

impl ProcessState {
    /// Parse the first character of a `ps` state column ("Ss", "R+", ...)
    pub fn from_ps(state: &str) -> Self {
        match state.chars().next() {
            Some('R') => ProcessState::Running,
            Some('S') => ProcessState::Sleeping,
            Some('D') => ProcessState::UninterruptibleSleep,
            Some('T') | Some('t') => ProcessState::Stopped,
            Some('I') => ProcessState::Idle,
            Some('Z') => ProcessState::Zombie,
            Some(c) => ProcessState::Unknown(c),
            None => ProcessState::Unknown('?'),
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Sleeping => write!(f, "sleeping"),
            ProcessState::UninterruptibleSleep => write!(f, "disk sleep"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Idle => write!(f, "idle"),
            ProcessState::Zombie => write!(f, "zombie"),
            ProcessState::Unknown(c) => write!(f, "unknown ({})", c),
        }
    }
}

/// One line of `ps` output
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStatus {
    pub pid: u32,
    pub state: ProcessState,
    pub percent_cpu: f64,
    /// Resident set size in KiB
    pub memory_kb: u64,
    pub cpu_time: Duration,
}

impl ProcessStatus {
    /// Parse one `pid state %cpu rss cputime` line
    pub fn from_ps_line(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let pid = fields.next()?.parse().ok()?;
        let state = ProcessState::from_ps(fields.next()?);
        let percent_cpu = fields.next()?.parse().ok()?;
        let memory_kb = fields.next()?.parse().ok()?;
        let cpu_time = parse_cputime(fields.next()?)?;
        Some(Self {
            pid,
            state,
            percent_cpu,
            memory_kb,
            cpu_time,
        })
    }
}

/// Parse all well-formed lines of `ps` output
pub fn parse_ps_output(output: &str) -> Vec<ProcessStatus> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let status = ProcessStatus::from_ps_line(line);
            if status.is_none() {
                debug!(line, "Skipping unparseable ps line");
            }
            status
        })
        .collect()
}

/// `[[dd-]hh:]mm:ss`
fn parse_cputime(value: &str) -> Option<Duration> {
    let (days, clock) = match value.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().ok()?, clock),
        None => (0, value),
    };
    let parts = clock
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => (0, *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return None,
    };
    let total = days
        .checked_mul(24)?
        .checked_add(hours)?
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?;
    Some(Duration::from_secs(total))
}

/// Looks up the processes of one process group
pub trait ProcessQuery: Send + Sync {
    fn query(&self, process_group: u32) -> BoxFuture<'_, std::io::Result<Vec<ProcessStatus>>>;
}

/// Runs `ps` on this machine
pub struct LocalProcessQuery;

impl ProcessQuery for LocalProcessQuery {
    fn query(&self, process_group: u32) -> BoxFuture<'_, std::io::Result<Vec<ProcessStatus>>> {
        Box::pin(async move {
            let mut cmd = Command::new("ps");
            cmd.args(["-g", &process_group.to_string(), "-o", PS_FORMAT]);
            run_ps(cmd).await
        })
    }
}

/// Runs `ps` on the controller host over ssh
pub struct SshProcessQuery {
    pub host: String,
    pub user: String,
}

impl ProcessQuery for SshProcessQuery {
    fn query(&self, process_group: u32) -> BoxFuture<'_, std::io::Result<Vec<ProcessStatus>>> {
        Box::pin(async move {
            let mut cmd = Command::new("ssh");
            cmd.args(["-o", "BatchMode=yes"])
                .arg(format!("{}@{}", self.user, self.host))
                .args(["ps", "-g", &process_group.to_string(), "-o", PS_FORMAT]);
            run_ps(cmd).await
        })
    }
}

// ps exits non-zero when the group is empty, so only spawn failures are errors
async fn run_ps(mut cmd: Command) -> std::io::Result<Vec<ProcessStatus>> {
    let output = cmd.kill_on_drop(true).output().await?;
    Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Local `ps` unless a controller host is configured
pub fn query_from_config(config: &ControllerConfig) -> Arc<dyn ProcessQuery> {
    if config.is_remote() {
        Arc::new(SshProcessQuery {
            host: config.host.clone(),
            user: config.user.clone(),
        })
    } else {
        Arc::new(LocalProcessQuery)
    }
}

/// A running job and its process
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job: OcrdJob,
    pub status: ProcessStatus,
}

/// What the jobs page shows
#[derive(Debug, Default)]
pub struct JobOverview {
    pub running: Vec<RunningJob>,
    pub completed: Vec<OcrdJob>,
}

/// Reads job files and asks about their processes
pub struct JobController {
    job_dir: PathBuf,
    query: Arc<dyn ProcessQuery>,
}

impl JobController {
    pub fn new(job_dir: impl Into<PathBuf>, query: Arc<dyn ProcessQuery>) -> Self {
        Self {
            job_dir: job_dir.into(),
            query,
        }
    }

    /// Every parseable job file in the job directory
    pub async fn jobs(&self) -> Vec<OcrdJob> {
        let job_dir = self.job_dir.clone();
        match tokio::task::spawn_blocking(move || read_jobs(&job_dir)).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(job_dir = %self.job_dir.display(), error = %e, "Job directory scan failed");
                Vec::new()
            }
        }
    }

    /// Status of the job's main process, if it is still around
    pub async fn status_for(&self, job: &OcrdJob) -> Option<ProcessStatus> {
        let pid = job.pid?;
        match self.query.query(pid).await {
            Ok(statuses) => statuses.into_iter().find(|status| status.pid == pid),
            Err(e) => {
                warn!(pid, error = %e, "Process query failed");
                None
            }
        }
    }

    /// Running jobs with a live process, and completed jobs newest first
    pub async fn overview(&self) -> JobOverview {
        let mut overview = JobOverview::default();
        for job in self.jobs().await {
            if job.is_completed() {
                overview.completed.push(job);
            } else if job.is_running() {
                if let Some(status) = self.status_for(&job).await {
                    overview.running.push(RunningJob { job, status });
                }
            }
        }
        overview
            .completed
            .sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        overview
    }
}

fn read_jobs(job_dir: &Path) -> Vec<OcrdJob> {
    let entries = match std::fs::read_dir(job_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(job_dir = %job_dir.display(), error = %e, "Cannot read job directory");
            return Vec::new();
        }
    };

    let mut jobs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| content.parse::<OcrdJob>().map_err(|e| e.to_string()));
        match parsed {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping job file"),
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING_JOB: &str = "\
PROCESS_ID=5432
TASK_ID=45989
PROCESS_DIR=/home/ocrd/data/5432
WORKDIR=ocr-d/data/5432
WORKFLOW=/workflow.sh
PID=1234
TIME_CREATED=2023-04-12T13:14:15
CONTROLLER=ocrd-controller:22
";

    /// Answers with a fixed process list
    struct FakeQuery(Vec<ProcessStatus>);

    impl ProcessQuery for FakeQuery {
        fn query(&self, _process_group: u32) -> BoxFuture<'_, std::io::Result<Vec<ProcessStatus>>> {
            Box::pin(async move { Ok(self.0.clone()) })
        }
    }

    fn status(pid: u32) -> ProcessStatus {
        ProcessStatus {
            pid,
            state: ProcessState::Running,
            percent_cpu: 12.5,
            memory_kb: 2048,
            cpu_time: Duration::from_secs(61),
        }
    }

    #[test]
    fn test_parse_running_job() {
        let job: OcrdJob = RUNNING_JOB.parse().unwrap();
        assert_eq!(job.process_id, 5432);
        assert_eq!(job.task_id, 45989);
        assert_eq!(job.workdir, PathBuf::from("ocr-d/data/5432"));
        assert_eq!(job.workflow_name(), "workflow.sh");
        assert_eq!(job.controller_address, "ocrd-controller:22");
        assert_eq!(job.pid, Some(1234));
        assert!(job.is_running());
        assert!(!job.is_completed());
        assert!(job.created_at().is_some());
    }

    #[test]
    fn test_parse_completed_job() {
        let content = RUNNING_JOB.replace("PID=1234\n", "RETURN_CODE=0\n");
        let job: OcrdJob = content.parse().unwrap();
        assert_eq!(job.return_code, Some(0));
        assert!(job.is_completed());
        assert!(!job.is_running());
    }

    #[test]
    fn test_parse_ignores_comments_and_blank_lines() {
        let content = format!("# written by the controller\n\n{}", RUNNING_JOB);
        assert!(content.parse::<OcrdJob>().is_ok());
    }

    #[test]
    fn test_parse_errors() {
        let missing = RUNNING_JOB.replace("WORKFLOW=/workflow.sh\n", "");
        assert_eq!(
            missing.parse::<OcrdJob>().unwrap_err(),
            JobParseError::MissingKey("WORKFLOW")
        );

        let invalid = RUNNING_JOB.replace("PID=1234", "PID=abc");
        assert!(matches!(
            invalid.parse::<OcrdJob>().unwrap_err(),
            JobParseError::InvalidValue { key: "PID", .. }
        ));

        let malformed = format!("{}garbage\n", RUNNING_JOB);
        assert!(matches!(
            malformed.parse::<OcrdJob>().unwrap_err(),
            JobParseError::MalformedLine { line: 9, .. }
        ));
    }

    #[test]
    fn test_parse_cputime() {
        assert_eq!(parse_cputime("00:01"), Some(Duration::from_secs(1)));
        assert_eq!(parse_cputime("01:02:03"), Some(Duration::from_secs(3723)));
        assert_eq!(
            parse_cputime("2-00:00:10"),
            Some(Duration::from_secs(2 * 86400 + 10))
        );
        assert_eq!(parse_cputime("abc"), None);
        assert_eq!(parse_cputime("99999999999999999-00:00:00"), None);
        assert_eq!(parse_cputime("18446744073709551615:00"), None);
    }

    #[test]
    fn test_parse_ps_output() {
        let output = "\
 1234 Ss    0.5  10240 00:00:03
 1240 R+   98.1 204800 01:02:03
garbage line
";
        let statuses = parse_ps_output(output);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].pid, 1234);
        assert_eq!(statuses[0].state, ProcessState::Sleeping);
        assert_eq!(statuses[0].memory_kb, 10240);
        assert_eq!(statuses[1].state, ProcessState::Running);
        assert_eq!(statuses[1].percent_cpu, 98.1);
        assert_eq!(statuses[1].cpu_time, Duration::from_secs(3723));
    }

    #[tokio::test]
    async fn test_status_for_matches_pid() {
        let controller =
            JobController::new("/nonexistent", Arc::new(FakeQuery(vec![status(1), status(1234)])));
        let job: OcrdJob = RUNNING_JOB.parse().unwrap();

        assert_eq!(controller.status_for(&job).await.unwrap().pid, 1234);

        let other = JobController::new("/nonexistent", Arc::new(FakeQuery(vec![status(1)])));
        assert!(other.status_for(&job).await.is_none());
    }

    #[tokio::test]
    async fn test_overview_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("running.env"), RUNNING_JOB).unwrap();
        std::fs::write(
            dir.path().join("done.env"),
            RUNNING_JOB.replace("PID=1234\n", "RETURN_CODE=1\n"),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.env"), "not a job").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let controller = JobController::new(dir.path(), Arc::new(FakeQuery(vec![status(1234)])));
        assert_eq!(controller.jobs().await.len(), 2);

        let overview = controller.overview().await;
        assert_eq!(overview.running.len(), 1);
        assert_eq!(overview.running[0].status.pid, 1234);
        assert_eq!(overview.completed.len(), 1);
        assert_eq!(overview.completed[0].return_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_job_dir() {
        let controller = JobController::new("/nonexistent/jobs", Arc::new(LocalProcessQuery));
        assert!(controller.jobs().await.is_empty());
    }
}
