use crate::registry::ModuleInfo;
use anyhow::Result;
use log::trace;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Payload of one `M:`/`S:` marker line: the address anchoring an interval
/// boundary and the total executions of the regions containing it.
pub struct Marker {
    pub addr: u64,
    pub count: i64,
    /// Module name and base address for symbolic rendering.
    pub module: Option<(String, u64)>,
}

/// Comment line written before each vector.
pub enum SliceComment {
    /// `# Slice at N`, per-thread instruction count (single-thread policy).
    Local(i64),
    /// `# Slice ending at global N`, identical across every file flushed at
    /// one shared boundary.
    Global(i64),
}

/// One region's line in the end-of-run cumulative dump.
pub struct FinalBlock {
    pub id: u32,
    pub start: u64,
    pub end: u64,
    pub static_insts: u32,
    pub count: i64,
    pub size_bytes: u64,
    /// Predecessor histogram, ascending predecessor id; empty when
    /// transition tracking is off.
    pub prev: Vec<(u32, i64)>,
}

/// Text writer for one `.bb` output file.
pub struct BbWriter {
    out: BufWriter<File>,
    symbolic: bool,
    slices: u64,
}

impl BbWriter {
    /// Open the file and write the header block: one `G:` line per already
    /// loaded module, then `I:`/`P:`/`C:`.
    pub fn create<P: AsRef<Path>>(
        path: P,
        pid: u32,
        command_line: &str,
        modules: &[ModuleInfo],
        symbolic: bool,
    ) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = Self {
            out: BufWriter::new(file),
            symbolic,
            slices: 0,
        };
        for module in modules {
            writer.module_loaded(module)?;
        }
        writeln!(writer.out, "I: 0")?;
        writeln!(writer.out, "P: {pid}")?;
        writeln!(writer.out, "C: sum:dummy Command:{command_line}")?;
        Ok(writer)
    }

    pub fn module_loaded(&mut self, module: &ModuleInfo) -> Result<()> {
        writeln!(
            self.out,
            "G: {} LowAddress: {:#x} LoadOffset: {:#x}",
            module.name, module.base, module.base
        )?;
        Ok(())
    }

    /// Write one slice: comment, `T` vector and marker. `vector` holds
    /// `(regionId, instructionsThisSlice)` in ascending id order.
    pub fn emit_slice(
        &mut self,
        comment: SliceComment,
        vector: &[(u32, i64)],
        marker: &Marker,
    ) -> Result<()> {
        match comment {
            SliceComment::Local(icount) => writeln!(self.out, "# Slice at {icount}")?,
            SliceComment::Global(icount) => {
                writeln!(self.out, "# Slice ending at global {icount}")?
            }
        }
        write!(self.out, "T")?;
        for (id, insts) in vector {
            write!(self.out, ":{id}:{insts} ")?;
        }
        writeln!(self.out)?;
        self.write_marker(marker)?;
        self.slices += 1;
        trace!("slice {} ends at {:#x}", self.slices, marker.addr);
        Ok(())
    }

    fn write_marker(&mut self, marker: &Marker) -> Result<()> {
        if self.symbolic {
            match &marker.module {
                Some((name, base)) => writeln!(
                    self.out,
                    "S: {:#x} {} {} {:#x} + {:#x}",
                    marker.addr,
                    marker.count,
                    name,
                    base,
                    marker.addr.saturating_sub(*base)
                )?,
                None => writeln!(self.out, "S: {:#x} {} no_image 0x0", marker.addr, marker.count)?,
            }
        } else {
            writeln!(self.out, "M: {:#x} {}", marker.addr, marker.count)?;
        }
        Ok(())
    }

    /// Write the end-of-run cumulative dump and the closing line.
    pub fn emit_final(&mut self, icount: i64, slice_size: i64, blocks: &[FinalBlock]) -> Result<()> {
        writeln!(self.out, "Dynamic instruction count {icount}")?;
        writeln!(self.out, "SliceSize: {slice_size}")?;
        for block in blocks {
            write!(
                self.out,
                "Block id: {} {:#x}:{:#x} static instructions: {} block count: {} block size: {}",
                block.id, block.start, block.end, block.static_insts, block.count, block.size_bytes
            )?;
            if !block.prev.is_empty() {
                write!(self.out, " previous-block counts: ( ")?;
                for (id, count) in &block.prev {
                    write!(self.out, "{id}:{count} ")?;
                }
                write!(self.out, ")")?;
            }
            writeln!(self.out)?;
        }
        writeln!(self.out, "End of bb")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Slices emitted so far.
    pub fn slices(&self) -> u64 {
        self.slices
    }
}

#[cfg(test)]
mod tests {
    use crate::emitter::{BbWriter, FinalBlock, Marker, SliceComment};
    use crate::registry::ModuleInfo;

    fn module(id: u32, name: &str, base: u64) -> ModuleInfo {
        ModuleInfo {
            id,
            name: name.to_string(),
            base,
            loaded: true,
        }
    }

    #[test]
    fn file_layout_matches_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.T.0.bb");
        let modules = vec![module(1, "a.out", 0x400000)];
        let mut writer = BbWriter::create(&path, 0, "./a.out --fast", &modules, true).unwrap();
        writer
            .emit_slice(
                SliceComment::Local(25),
                &[(1, 20), (2, 5)],
                &Marker {
                    addr: 0x400100,
                    count: 3,
                    module: Some(("a.out".to_string(), 0x400000)),
                },
            )
            .unwrap();
        writer
            .emit_slice(
                SliceComment::Local(45),
                &[],
                &Marker {
                    addr: 0xdead,
                    count: 1,
                    module: None,
                },
            )
            .unwrap();
        writer
            .emit_final(
                45,
                20,
                &[
                    FinalBlock {
                        id: 1,
                        start: 0x400100,
                        end: 0x400110,
                        static_insts: 10,
                        count: 2,
                        size_bytes: 0x14,
                        prev: vec![(0, 1), (2, 1)],
                    },
                    FinalBlock {
                        id: 2,
                        start: 0x400200,
                        end: 0x400204,
                        static_insts: 5,
                        count: 1,
                        size_bytes: 0x8,
                        prev: vec![],
                    },
                ],
            )
            .unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.slices(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let expected = "G: a.out LowAddress: 0x400000 LoadOffset: 0x400000\n\
            I: 0\n\
            P: 0\n\
            C: sum:dummy Command:./a.out --fast\n\
            # Slice at 25\n\
            T:1:20 :2:5 \n\
            S: 0x400100 3 a.out 0x400000 + 0x100\n\
            # Slice at 45\n\
            T\n\
            S: 0xdead 1 no_image 0x0\n\
            Dynamic instruction count 45\n\
            SliceSize: 20\n\
            Block id: 1 0x400100:0x400110 static instructions: 10 block count: 2 block size: 20 previous-block counts: ( 0:1 2:1 )\n\
            Block id: 2 0x400200:0x400204 static instructions: 5 block count: 1 block size: 8\n\
            End of bb\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn non_symbolic_markers_use_m_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.global.bb");
        let mut writer = BbWriter::create(&path, 0, "cmd", &[], false).unwrap();
        writer
            .emit_slice(
                SliceComment::Global(100),
                &[(3, 100)],
                &Marker {
                    addr: 0x1234,
                    count: 7,
                    module: Some(("ignored".to_string(), 0x1000)),
                },
            )
            .unwrap();
        writer.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "I: 0\nP: 0\nC: sum:dummy Command:cmd\n# Slice ending at global 100\nT:3:100 \nM: 0x1234 7\n"
        );
    }
}
