use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::process::{ChildStdout, Command, Stdio};
use std::thread;

use prompt_lineage_core::{MethodologyRecord, Transform, TransformError};
use tracing::debug;

pub const METHODOLOGY_NAME_ENV: &str = "PL_METHODOLOGY_NAME";
pub const METHODOLOGY_KIND_ENV: &str = "PL_METHODOLOGY_KIND";
pub const METHODOLOGY_PATH_ENV: &str = "PL_METHODOLOGY_PATH";

/// Runs an external program as the transform.
///
/// The content goes to the program's stdin. Every stdout line is forwarded to
/// the progress sink as it arrives, and the whole stdout becomes the result.
/// A non-zero exit status fails the transform.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
}

impl CommandTransform {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }
}

impl Transform for CommandTransform {
    fn transform(
        &mut self,
        content: &str,
        methodology: &MethodologyRecord,
        progress: &mut dyn FnMut(&str),
    ) -> Result<String, TransformError> {
        debug!(program = %self.program, methodology = %methodology.name, "spawning transform");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(METHODOLOGY_NAME_ENV, &methodology.name)
            .env(METHODOLOGY_KIND_ENV, methodology.kind.as_str())
            .env(METHODOLOGY_PATH_ENV, &methodology.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| TransformError::Failed(format!("failed to start {}: {err}", self.program)))?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransformError::Failed("transform pipes were not captured".to_string()));
        };

        // Feed stdin from another thread so a chatty program cannot block on a
        // full stdout pipe while we are still writing.
        let input = content.to_string();
        let writer = thread::spawn(move || stdin.write_all(input.as_bytes()));

        let streamed = stream_stdout(stdout, progress);
        if streamed.is_err() {
            // Nothing will drain stdout any more; stop the child so it can be reaped.
            let _ = child.kill();
        }
        let status = child.wait();
        let written = writer.join();

        let output = streamed
            .map_err(|err| TransformError::Failed(format!("failed to read transform output: {err}")))?;
        let status = status
            .map_err(|err| TransformError::Failed(format!("failed to wait for {}: {err}", self.program)))?;

        match written {
            Ok(Ok(())) => {}
            // The program may exit without reading its input.
            Ok(Err(err)) if err.kind() == ErrorKind::BrokenPipe => {}
            Ok(Err(err)) => {
                return Err(TransformError::Failed(format!("failed to write transform input: {err}")));
            }
            Err(_) => return Err(TransformError::Failed("transform input writer panicked".to_string())),
        }

        if !status.success() {
            return Err(TransformError::Failed(format!("{} exited with {status}", self.program)));
        }
        String::from_utf8(output)
            .map_err(|_| TransformError::Failed(format!("{} wrote output that is not UTF-8", self.program)))
    }
}

/// Forward each stdout line to `progress` and keep the raw bytes.
fn stream_stdout(stdout: ChildStdout, progress: &mut dyn FnMut(&str)) -> io::Result<Vec<u8>> {
    let mut reader = BufReader::new(stdout);
    let mut output = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(output);
        }
        let text = String::from_utf8_lossy(&line);
        progress(text.trim_end_matches(['\r', '\n']));
        output.extend_from_slice(&line);
    }
}
