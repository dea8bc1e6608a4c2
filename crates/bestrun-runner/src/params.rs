use bestrun_core::{PipelineError, Result};
use std::io::BufRead;

/// Total parameter count of a model parameter dump.
///
/// Every line starting with `#` that carries a `{d1,d2,...}` shape adds the
/// product of its dimensions; all other lines are ignored.
pub fn count_params<R: BufRead>(reader: R) -> Result<u64> {
    let mut total: u64 = 0;
    for (idx, line) in reader.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.map_err(|e| PipelineError::ParamLine {
            line: lineno,
            reason: e.to_string(),
        })?;
        if !line.starts_with('#') {
            continue;
        }
        let Some(shape) = shape_of(&line) else {
            continue;
        };
        total += shape_size(shape).map_err(|reason| PipelineError::ParamLine { line: lineno, reason })?;
    }
    Ok(total)
}

/// Text between the first `{` and the last `}` of the line, if non-empty.
/// Two brace groups on one line therefore read as a single bad shape.
fn shape_of(line: &str) -> Option<&str> {
    let open = line.find('{')?;
    let close = line.rfind('}')?;
    (close > open + 1).then(|| &line[open + 1..close])
}

fn shape_size(shape: &str) -> std::result::Result<u64, String> {
    shape.split(',').try_fold(1u64, |acc, dim| {
        let d: u64 = dim
            .trim()
            .parse()
            .map_err(|_| format!("invalid dimension '{}'", dim.trim()))?;
        acc.checked_mul(d)
            .ok_or_else(|| format!("shape {{{}}} overflows", shape))
    })
}
