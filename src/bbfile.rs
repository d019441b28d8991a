use anyhow::{Context, Result, bail};
use std::path::Path;

/// Parsed `M:`/`S:` marker line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbMarker {
    pub addr: u64,
    pub count: i64,
    pub symbolic: bool,
    /// Module name and base; `None` for `M:` lines and `no_image` markers.
    pub module: Option<(String, u64)>,
}

/// One slice section: optional comment value, `T` vector, marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BbSlice {
    /// Instruction count from the preceding `# Slice ...` comment.
    pub icount: Option<i64>,
    /// True when the comment was `# Slice ending at global N`.
    pub global: bool,
    pub vector: Vec<(u32, i64)>,
    pub marker: Option<BbMarker>,
}

/// One `Block id:` line of the final dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BbBlock {
    pub id: u32,
    pub start: u64,
    pub end: u64,
    pub static_insts: u32,
    pub count: i64,
    pub size_bytes: u64,
    pub prev: Vec<(u32, i64)>,
}

/// A parsed `.bb` profile.
#[derive(Debug, Default, Clone)]
pub struct BbFile {
    /// `G:` lines in file order: (name, base).
    pub modules: Vec<(String, u64)>,
    pub pid: u32,
    pub command_line: String,
    pub slices: Vec<BbSlice>,
    pub blocks: Vec<BbBlock>,
    pub dynamic_inst_count: Option<i64>,
    pub slice_size: Option<i64>,
    /// Whether the closing `End of bb` line was seen.
    pub terminated: bool,
}

fn parse_hex(token: &str) -> Result<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    Ok(u64::from_str_radix(digits, 16)?)
}

impl BbFile {
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut file = BbFile::default();
        // comment value carried to the next T line
        let mut comment: Option<(i64, bool)> = None;
        for (index, line) in text.lines().enumerate() {
            let lineno = index + 1;
            if let Some(rest) = line.strip_prefix("G: ") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() != 5 || fields[1] != "LowAddress:" {
                    bail!("line {lineno}: malformed module line {line:?}");
                }
                file.modules.push((fields[0].to_string(), parse_hex(fields[2])?));
            } else if let Some(rest) = line.strip_prefix("P: ") {
                file.pid = rest.trim().parse()?;
            } else if let Some(rest) = line.strip_prefix("C: ") {
                file.command_line = rest
                    .strip_prefix("sum:dummy Command:")
                    .unwrap_or(rest)
                    .to_string();
            } else if let Some(rest) = line.strip_prefix("# Slice ending at global ") {
                comment = Some((rest.trim().parse()?, true));
            } else if let Some(rest) = line.strip_prefix("# Slice at ") {
                comment = Some((rest.trim().parse()?, false));
            } else if let Some(rest) = line.strip_prefix("T") {
                let mut slice = BbSlice::default();
                if let Some((icount, global)) = comment.take() {
                    slice.icount = Some(icount);
                    slice.global = global;
                }
                for token in rest.split_whitespace() {
                    let Some(token) = token.strip_prefix(':') else {
                        bail!("line {lineno}: malformed vector token {token:?}");
                    };
                    let Some((id, insts)) = token.split_once(':') else {
                        bail!("line {lineno}: malformed vector token {token:?}");
                    };
                    slice.vector.push((id.parse()?, insts.parse()?));
                }
                file.slices.push(slice);
            } else if let Some(rest) = line.strip_prefix("S: ") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() != 4 && fields.len() != 6 {
                    bail!("line {lineno}: malformed marker line {line:?}");
                }
                let module = if fields.len() == 6 {
                    Some((fields[2].to_string(), parse_hex(fields[3])?))
                } else if fields[2] == "no_image" {
                    None
                } else {
                    bail!("line {lineno}: malformed marker line {line:?}");
                };
                Self::attach_marker(
                    &mut file,
                    lineno,
                    BbMarker {
                        addr: parse_hex(fields[0])?,
                        count: fields[1].parse()?,
                        symbolic: true,
                        module,
                    },
                )?;
            } else if let Some(rest) = line.strip_prefix("M: ") {
                let fields: Vec<&str> = rest.split_whitespace().collect();
                if fields.len() != 2 {
                    bail!("line {lineno}: malformed marker line {line:?}");
                }
                Self::attach_marker(
                    &mut file,
                    lineno,
                    BbMarker {
                        addr: parse_hex(fields[0])?,
                        count: fields[1].parse()?,
                        symbolic: false,
                        module: None,
                    },
                )?;
            } else if let Some(rest) = line.strip_prefix("Block id: ") {
                file.blocks.push(Self::parse_block(lineno, rest)?);
            } else if let Some(rest) = line.strip_prefix("Dynamic instruction count ") {
                file.dynamic_inst_count = Some(rest.trim().parse()?);
            } else if let Some(rest) = line.strip_prefix("SliceSize: ") {
                file.slice_size = Some(rest.trim().parse()?);
            } else if line == "End of bb" {
                file.terminated = true;
            } else if line.starts_with("I: ") || line.starts_with('#') || line.is_empty() {
                // header echo and unknown comments are tolerated
            } else {
                bail!("line {lineno}: unrecognized line {line:?}");
            }
        }
        Ok(file)
    }

    fn attach_marker(file: &mut BbFile, lineno: usize, marker: BbMarker) -> Result<()> {
        match file.slices.last_mut() {
            Some(slice) if slice.marker.is_none() => {
                slice.marker = Some(marker);
                Ok(())
            }
            _ => bail!("line {lineno}: marker line without a preceding T line"),
        }
    }

    fn parse_block(lineno: usize, rest: &str) -> Result<BbBlock> {
        // <id> <start>:<end> static instructions: <n> block count: <c>
        // block size: <b> [previous-block counts: ( id:n ... )]
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 11 {
            bail!("line {lineno}: malformed block line");
        }
        let Some((start, end)) = fields[1].split_once(':') else {
            bail!("line {lineno}: malformed block address range {:?}", fields[1]);
        };
        let mut block = BbBlock {
            id: fields[0].parse()?,
            start: parse_hex(start)?,
            end: parse_hex(end)?,
            static_insts: fields[4].parse()?,
            count: fields[7].parse()?,
            size_bytes: fields[10].parse()?,
            prev: vec![],
        };
        if fields.len() > 11 {
            if fields[11] != "previous-block" || fields.len() < 14 {
                bail!("line {lineno}: malformed block suffix");
            }
            for token in &fields[13..] {
                if *token == "(" {
                    continue;
                }
                if *token == ")" {
                    break;
                }
                let Some((id, count)) = token.split_once(':') else {
                    bail!("line {lineno}: malformed transition token {token:?}");
                };
                block.prev.push((id.parse()?, count.parse()?));
            }
        }
        Ok(block)
    }

    /// Sum of all emitted vector tokens, in instructions.
    pub fn total_slice_instructions(&self) -> i64 {
        self.slices
            .iter()
            .flat_map(|s| s.vector.iter())
            .map(|(_, insts)| insts)
            .sum()
    }

    /// Cumulative executions of `id` from the final dump.
    pub fn block_count(&self, id: u32) -> i64 {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .map_or(0, |b| b.count)
    }
}
