use std::{collections::BTreeMap as Map, path::PathBuf, time::Duration};

/// A named bucket of upstream releases sharing one CUDA/Python combination and one
/// Dockerfile.
#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct VersionGroupSpec {
    pub name: &'static str,
    pub cuda_version: &'static str,
    pub python_version: &'static str,
    pub dockerfile: &'static str,
}

impl VersionGroupSpec {
    pub fn base_image(&self) -> BaseImageSpec {
        BaseImageSpec {
            cuda_version: self.cuda_version,
            python_version: self.python_version,
        }
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct BaseImageSpec {
    pub cuda_version: &'static str,
    pub python_version: &'static str,
}

#[derive(Clone, Debug, Hash, PartialOrd, Ord, PartialEq, Eq)]
pub struct ImageTag(pub String);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvSetupRequest {
    pub commit: String,
    pub test_patch: Option<PathBuf>,
    pub source_patch: Option<PathBuf>,
    pub skip_build: bool,
    pub editable: bool,
}

/// A single external process invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Map<String, String>,
    pub timeout: Option<Duration>,
    /// Capture stdout/stderr instead of inheriting the terminal.
    pub capture: bool,
}

impl Invocation {
    pub fn new<S: Into<String>>(program: S) -> Invocation {
        Invocation {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Map::new(),
            timeout: None,
            capture: false,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Invocation {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Invocation {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Invocation {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Invocation {
        self.timeout = Some(timeout);
        self
    }

    pub fn capture(mut self) -> Invocation {
        self.capture = true;
        self
    }

    /// Shell-quoted rendering, prefixed by any extra environment.
    pub fn command_line(&self) -> String {
        let env = self
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, shell_words::quote(value)));
        let command = shell_words::join(std::iter::once(&self.program).chain(self.args.iter()));

        env.chain(std::iter::once(command))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// `None` when the process was killed by a signal or by the timeout.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Outcome {
    pub fn ok() -> Outcome {
        Outcome::exited(0)
    }

    pub fn exited(code: i32) -> Outcome {
        Outcome {
            code: Some(code),
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn with_stdout<S: Into<String>>(mut self, stdout: S) -> Outcome {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr<S: Into<String>>(mut self, stderr: S) -> Outcome {
        self.stderr = stderr.into();
        self
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// First non-empty line of stdout, falling back to stderr.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}
