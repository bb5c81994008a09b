#![cfg(test)]

//! This module runs test cases defined in `server/test/cases`.
//!
//! Each test case is a JSON file `<name>.json` containing a list of steps. Each step is a request
//! and the expected response:
//! ```json
//! {
//!     "request": { "method": "POST", "path": "/login", "body": { ... } },
//!     "status": 200,
//!     "response": { ... }
//! }
//! ```
//! `"body"` and `"response"` are optional; if `"response"` is omitted only the status is checked.
//! A request may also carry `"headers"`, and a step may list expected response `"headers"`, each
//! of which must be among the values the server sent for that name.
//!
//! To run with image caching enabled, the file can instead be an object
//! `{ "cache": ["<name>", ...], "steps": [...] }`. The listed files are created in the cache
//! directory before the server starts, so they are served without downloading.
//!
//! Every test case gets its own server, backed by the local accounts in `testdata` and a fresh
//! session directory, so cases can run concurrently without observing each other's logins.
//! Steps within a case run in order.

use super::Options;
use ansi_term::Color;
use anyhow::Error;
use async_std::task::{sleep, spawn};
use clonner_model::{cache, init_logging, session};
use futures::future::join_all;
use portpicker::pick_unused_port;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use surf::{http::Method, Client};
use tempfile::TempDir;

#[async_std::test]
async fn http_api_test_cases() -> Result<(), Error> {
    init_logging();

    // Discover test cases.
    let crate_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let testdata = crate_dir.parent().unwrap().join("testdata");
    let mut paths = crate_dir
        .join("test/cases")
        .read_dir()?
        .filter_map(|dirent| {
            let path = dirent.unwrap().path();
            if path.extension()?.to_str().unwrap() == "json" {
                Some(path)
            } else {
                None
            }
        })
        .collect::<Vec<_>>();
    paths.sort();
    let test_cases = paths
        .iter()
        .map(TestCase::new)
        .collect::<Result<Vec<_>, _>>()?;
    assert!(!test_cases.is_empty(), "no test cases found");

    let results = join_all(
        test_cases
            .into_iter()
            .map(|test| test.run(testdata.clone())),
    )
    .await;
    for result in &results {
        println!("{}", result);
    }
    if results.iter().any(TestResult::failed) {
        Err(Error::msg(format!("{}", Color::Red.paint("tests failed"))))
    } else {
        println!("All test cases passed.");
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum CaseFile {
    Steps(Vec<Step>),
    Cached { cache: Vec<String>, steps: Vec<Step> },
}

#[derive(Clone, Debug, Deserialize)]
struct Step {
    request: StepRequest,
    status: u16,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
struct StepRequest {
    method: String,
    path: String,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Clone, Debug)]
struct TestCase {
    name: OsString,
    /// Files to seed the image cache with, if caching is enabled for this case.
    cache: Option<Vec<String>>,
    steps: Vec<Step>,
}

impl TestCase {
    fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let name = path.file_stem().unwrap();
        let file = serde_json::from_reader(File::open(path)?)
            .map_err(|err| Error::msg(format!("malformed test case {}: {err}", path.display())))?;
        let (cache, steps) = match file {
            CaseFile::Steps(steps) => (None, steps),
            CaseFile::Cached { cache, steps } => (Some(cache), steps),
        };
        Ok(Self {
            name: name.into(),
            cache,
            steps,
        })
    }

    async fn run(self, testdata: PathBuf) -> TestResult {
        TestResult {
            name: self.name,
            failure: Self::do_test(testdata, self.cache, self.steps).await.err(),
        }
    }

    async fn do_test(
        testdata: PathBuf,
        cached: Option<Vec<String>>,
        steps: Vec<Step>,
    ) -> Result<(), Error> {
        // Start a server with its own session and cache directories.
        let tmp = TempDir::new()?;
        let cache_dir = tmp.path().join("cache");
        if let Some(names) = &cached {
            fs::create_dir_all(&cache_dir)?;
            for name in names {
                fs::write(cache_dir.join(name), format!("cached {name}"))?;
            }
        }
        let port = pick_unused_port().ok_or_else(|| Error::msg("no free port"))?;
        let opt = Options {
            port,
            host: "127.0.0.1".into(),
            local: Some(testdata),
            log_dir: None,
            sessions: session::Options {
                sessions_dir: tmp.path().join("sessions"),
            },
            cache: cache::Options {
                cache_dir,
                cache_images: cached.is_some(),
            },
        };
        spawn(async move {
            if let Err(err) = opt.serve().await {
                tracing::error!("server exited: {err}");
            }
        });

        // Connect a client.
        let client: Client = surf::Config::default()
            .set_base_url(format!("http://127.0.0.1:{port}").parse()?)
            .try_into()?;
        // Wait for the server to come up.
        wait_for_server(&client).await?;

        for (i, step) in steps.into_iter().enumerate() {
            Self::do_step(&client, step)
                .await
                .map_err(|err| Error::msg(format!("step {i}: {err}")))?;
        }
        Ok(())
    }

    async fn do_step(client: &Client, step: Step) -> Result<(), Error> {
        let method: Method = step.request.method.parse().map_err(Error::msg)?;
        let mut req = client.request(method, &step.request.path);
        for (name, value) in &step.request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &step.request.body {
            req = req.body_json(body).map_err(Error::msg)?;
        }
        let mut res = req.send().await.map_err(Error::msg)?;

        let status = u16::from(res.status());
        let body = res.body_bytes().await.map_err(Error::msg)?;
        let body = String::from_utf8_lossy(&body);
        if status != step.status {
            return Err(Error::msg(format!(
                "{} {}: expected status {}, got {status}: {body}",
                step.request.method, step.request.path, step.status
            )));
        }

        for (name, expected) in &step.headers {
            let values = res
                .header(name.as_str())
                .map(|values| values.iter().map(|v| v.as_str()).collect::<Vec<_>>())
                .unwrap_or_default();
            if !values.contains(&expected.as_str()) {
                return Err(Error::msg(format!(
                    "{} {}: expected header {name}: {expected}, got {values:?}",
                    step.request.method, step.request.path
                )));
            }
        }

        if let Some(expected) = step.response {
            let actual: Value = serde_json::from_str(&body)
                .map_err(|err| Error::msg(format!("cannot parse response body as JSON: {err}")))?;
            if actual != expected {
                return Err(Error::msg(format!(
                    "{} {}: expected response:\n{expected}\nactual response:\n{actual}",
                    step.request.method, step.request.path
                )));
            }
        }
        Ok(())
    }
}

struct TestResult {
    name: OsString,
    failure: Option<anyhow::Error>,
}

impl TestResult {
    fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl Display for TestResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}...", self.name.to_string_lossy())?;
        if let Some(err) = &self.failure {
            writeln!(f, "{}", Color::Red.paint("FAILED"))?;
            write!(f, "{err}")?;
        } else {
            write!(f, "{}", Color::Green.paint("OK"))?;
        }
        Ok(())
    }
}

async fn wait_for_server(client: &Client) -> Result<(), Error> {
    const MAX_CONNECT_RETRIES: usize = 60;

    for _ in 0..MAX_CONNECT_RETRIES {
        match client.get("/health").await {
            Ok(_) => return Ok(()),
            Err(err) => {
                tracing::warn!("waiting for server to start: {err}");
                sleep(Duration::from_millis(250)).await;
            }
        }
    }

    Err(Error::msg("timed out waiting for server"))
}
