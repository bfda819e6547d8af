use std::path::PathBuf;
use std::process::Command;

use tracing::trace;

use crate::netns::Namespace;
use crate::{Error, Result};

const EXISTS_MESSAGES: &[&str] = &["File exists"];
const MISSING_MESSAGES: &[&str] = &[
    "No such process",
    "Cannot find device",
    "No such file or directory",
    "does not exist",
];

/// Runs iproute2's `ip` binary, optionally inside a network namespace.
#[derive(Clone, Debug)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ip"),
        }
    }
}

impl IpRoute2 {
    pub(crate) fn exec(&self, netns: Option<&Namespace>, args: &[&str]) -> Result<String> {
        match netns {
            Some(ns) => ns.run(|| self.exec_here(args)),
            None => self.exec_here(args),
        }
    }

    fn exec_here(&self, args: &[&str]) -> Result<String> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        trace!(%command, "running");
        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(command, stderr))
    }
}

/// Maps iproute2 diagnostics onto the idempotency-relevant error kinds.
pub(crate) fn classify(command: String, stderr: String) -> Error {
    if EXISTS_MESSAGES.iter().any(|m| stderr.contains(m)) {
        return Error::AlreadyExists(command);
    }
    if MISSING_MESSAGES.iter().any(|m| stderr.contains(m)) {
        return Error::NotFound(command);
    }
    Error::Command { command, stderr }
}

/// Parses the index out of `ip -o link show dev <name>`.
pub(crate) fn parse_link_index(output: &str) -> Result<u32> {
    let line = output
        .lines()
        .next()
        .ok_or_else(|| Error::Parse("empty link listing".into()))?;
    let (index, _) = line
        .split_once(':')
        .ok_or_else(|| Error::Parse(format!("link line `{line}`")))?;
    index
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("link index `{index}`")))
}

/// Parses link names out of `ip -o link show`, dropping the `@peer` suffix.
pub(crate) fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let name = line.split(':').nth(1)?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}
