use std::process::Command;

use crate::common::error::RunnerError;
use crate::resources::GpuBoard;

/// Discovers the GPU boards on this host using `nvidia-smi`.
/// Example expected output:
/// ```console
/// $ nvidia-smi --format=csv,noheader --query-gpu=index,name,memory.total
/// 0, NVIDIA GeForce GTX 1080 Ti, 11264 MiB
/// 1, NVIDIA GeForce GTX 1080 Ti, 11264 MiB
/// ```
pub fn detect_boards() -> crate::Result<Vec<GpuBoard>> {
    let mut command = Command::new("nvidia-smi");
    command.args(["--format=csv,noheader", "--query-gpu=index,name,memory.total"]);
    let output = command
        .output()
        .map_err(|error| RunnerError::Config(format!("cannot execute nvidia-smi: {error:?}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(RunnerError::Config(format!(
            "nvidia-smi exited with error code {}\nStdout: {stdout}\nStderr: {stderr}",
            output.status
        )));
    }

    parse_boards(&stdout)
}

fn parse_boards(output: &str) -> crate::Result<Vec<GpuBoard>> {
    let mut boards = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut iter = line.split(',').map(|v| v.trim());
        let id = iter
            .next()
            .unwrap_or("")
            .parse::<u32>()
            .map_err(|_| RunnerError::Config(format!("unparseable nvidia-smi line {line:?}")))?;
        let name = iter.next().unwrap_or("unknown").to_string();
        let mem = iter.next().and_then(parse_mem).unwrap_or(0);
        boards.push(GpuBoard {
            id,
            name,
            // One schedulable slot per physical device; multi-slot boards
            // can be configured by tests or future board grouping.
            slots: 1,
            mem,
        });
    }
    Ok(boards)
}

fn parse_mem(value: &str) -> Option<u64> {
    let number = value
        .trim_end_matches("MiB")
        .trim_end_matches("GiB")
        .trim()
        .parse::<u64>()
        .ok()?;
    if value.ends_with("GiB") {
        Some(number * 1024 * 1024 * 1024)
    } else {
        Some(number * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::parse_boards;

    #[test]
    fn test_parse_nvidia_smi_output() {
        let output = "0, NVIDIA GeForce GTX 1080 Ti, 11264 MiB\n1, Tesla V100-SXM2, 16384 MiB\n";
        let boards = parse_boards(output).unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards[0].id, 0);
        assert_eq!(boards[0].name, "NVIDIA GeForce GTX 1080 Ti");
        assert_eq!(boards[0].mem, 11264 * 1024 * 1024);
        assert_eq!(boards[1].id, 1);
        assert_eq!(boards[1].slots, 1);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_boards("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_boards("not, a, gpu line").is_err());
    }
}
