//! HTML pages served by the proxy

use crate::jobs::{JobOverview, OcrdJob, RunningJob};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};

/// Wrap an HTML document in a response
pub fn html_response(status: StatusCode, html: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Full::new(Bytes::from(html)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Percent-encode each segment of a workspace path for use in a URL
pub fn url_path(workspace: &Path) -> String {
    workspace
        .iter()
        .map(|segment| urlencoding::encode(&segment.to_string_lossy()).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>{STYLE}</style>
</head>
<body>
    <nav><a href="/workspaces/">Workspaces</a> <a href="/jobs/">Jobs</a></nav>
    <main>
{body}
    </main>
</body>
</html>
"#,
        title = escape_html(title),
        body = body,
    )
}

pub fn workspace_list(workspaces: &[PathBuf]) -> String {
    let mut body = String::from("<h1>Workspaces</h1>\n");
    if workspaces.is_empty() {
        body.push_str("<p>No workspaces found.</p>\n");
    } else {
        body.push_str("<ul class=\"workspaces\">\n");
        for workspace in workspaces {
            body.push_str(&format!(
                "<li><a href=\"/workspaces/open/{}\">{}</a></li>\n",
                url_path(workspace),
                escape_html(&workspace.to_string_lossy())
            ));
        }
        body.push_str("</ul>\n");
    }
    layout("Workspaces", &body)
}

/// Frame around the proxied view. The trailing slash matters: broadway.js
/// resolves its socket against `window.location`.
pub fn workspace_view(workspace: &Path) -> String {
    let name = escape_html(&workspace.to_string_lossy());
    let body = format!(
        "<h1>{name}</h1>\n<iframe class=\"viewer\" src=\"/workspaces/view/{}/\" title=\"{name}\"></iframe>\n",
        url_path(workspace),
    );
    layout(&workspace.to_string_lossy(), &body)
}

pub fn view_unavailable(workspace: &Path) -> String {
    let body = format!(
        "<h1>View unavailable</h1>\n<p>The viewer for <code>{}</code> is not responding. \
         It may still be starting; reload to try again.</p>\n",
        escape_html(&workspace.to_string_lossy())
    );
    layout("View unavailable", &body)
}

pub fn launch_failed(workspace: &Path) -> String {
    let body = format!(
        "<h1>Viewer could not be started</h1>\n<p>No viewer is available for <code>{}</code>.</p>\n\
         <p><a href=\"/workspaces/\">Back to workspaces</a></p>\n",
        escape_html(&workspace.to_string_lossy())
    );
    layout("Viewer could not be started", &body)
}

pub fn jobs(overview: &JobOverview) -> String {
    let mut body = String::from("<h1>Running jobs</h1>\n");
    if overview.running.is_empty() {
        body.push_str("<p>No jobs running.</p>\n");
    } else {
        body.push_str(
            "<table class=\"running\">\n<tr><th>Task</th><th>Process</th><th>Workflow</th>\
             <th>PID</th><th>State</th><th>CPU %</th><th>Memory (KiB)</th><th>CPU time</th></tr>\n",
        );
        for running in &overview.running {
            body.push_str(&running_row(running));
        }
        body.push_str("</table>\n");
    }

    body.push_str("<h1>Completed jobs</h1>\n");
    if overview.completed.is_empty() {
        body.push_str("<p>No completed jobs.</p>\n");
    } else {
        body.push_str(
            "<table class=\"completed\">\n<tr><th>Task</th><th>Process</th><th>Workflow</th>\
             <th>Return code</th><th>Created</th><th>Terminated</th></tr>\n",
        );
        for job in &overview.completed {
            body.push_str(&completed_row(job));
        }
        body.push_str("</table>\n");
    }
    layout("Jobs", &body)
}

fn running_row(running: &RunningJob) -> String {
    let RunningJob { job, status } = running;
    format!(
        "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.1}</td><td>{}</td><td>{}</td></tr>\n",
        job.task_id,
        job.process_id,
        escape_html(&job.workflow_name()),
        status.pid,
        status.state,
        status.percent_cpu,
        status.memory_kb,
        format_duration(status.cpu_time.as_secs()),
    )
}

fn completed_row(job: &OcrdJob) -> String {
    let return_code = job.return_code.unwrap_or_default();
    format!(
        "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
        if return_code == 0 { "success" } else { "failure" },
        job.task_id,
        job.process_id,
        escape_html(&job.workflow_name()),
        return_code,
        escape_html(job.time_created.as_deref().unwrap_or("")),
        escape_html(job.time_terminated.as_deref().unwrap_or("")),
    )
}

fn format_duration(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

const STYLE: &str = r#"
body { font-family: sans-serif; margin: 0; }
nav { background: #2c3e50; padding: 0.5em 1em; }
nav a { color: #ecf0f1; margin-right: 1em; text-decoration: none; }
main { padding: 1em; }
iframe.viewer { border: 1px solid #ccc; width: 100%; height: 85vh; }
table { border-collapse: collapse; }
th, td { border: 1px solid #ddd; padding: 0.3em 0.6em; text-align: left; }
tr.failure td { color: #c0392b; }
"#;
