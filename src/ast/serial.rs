use anyhow::{anyhow, Result};

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use crate::ast::{Node, NodeId, Op};
use crate::reader::{RecordBufRead, RecordWrite};
use crate::sym::SymId;
use crate::types::Prim;

const FLAG_RVALUE: u8 = 1 << 0;
const FLAG_HAS_NAME: u8 = 1 << 1;

/// Append one node record: the fixed-width fields followed by the
/// name string when the node carries one.
fn write_node<W: Write>(out: &mut W, n: &Node) -> Result<()> {
    out.write_u8(n.op.into())?;
    out.write_u16(n.prim.into_raw())?;
    let mut flags = 0;
    if n.rvalue {
        flags |= FLAG_RVALUE;
    }
    if n.name.is_some() {
        flags |= FLAG_HAS_NAME;
    }
    out.write_u8(flags)?;
    out.write_u32(n.id.0)?;
    out.write_u32(n.left_id.map(|i| i.0).unwrap_or(0))?;
    out.write_u32(n.mid_id.map(|i| i.0).unwrap_or(0))?;
    out.write_u32(n.right_id.map(|i| i.0).unwrap_or(0))?;
    out.write_u32(n.ctype.map(|i| i.0).unwrap_or(0))?;
    out.write_u32(n.sym.map(|i| i.0).unwrap_or(0))?;
    out.write_i64(n.value)?;
    out.write_i32(n.line)?;
    if let Some(name) = &n.name {
        out.write_cstr(name)?;
    }
    Ok(())
}

/// Read one node record. The children come back as ids only; the
/// owned child slots are left empty for the loader to fill lazily.
fn read_node<R: RecordBufRead>(input: &mut R) -> Result<Option<Node>> {
    let Some(tag) = input.fill_buf()?.first().copied() else {
        return Ok(None);
    };
    input.consume(1);
    let op = Op::try_from(tag).map_err(|_| anyhow!("Invalid AST op tag {tag:#04x}"))?;
    let prim = Prim::from_raw(input.read_u16()?)?;
    let flags = input.read_u8()?;
    let id = NodeId(input.read_u32()?);
    let ids = [
        input.read_u32()?,
        input.read_u32()?,
        input.read_u32()?,
    ];
    let ctype = match input.read_u32()? {
        0 => None,
        c => Some(SymId(c)),
    };
    let sym = match input.read_u32()? {
        0 => None,
        s => Some(SymId(s)),
    };
    let value = input.read_i64()?;
    let line = input.read_i32()?;
    let name = if flags & FLAG_HAS_NAME != 0 {
        Some(input.read_cstr()?)
    } else {
        None
    };

    let child = |raw: u32| if raw == 0 { None } else { Some(NodeId(raw)) };
    Ok(Some(Node {
        op,
        prim,
        ctype,
        rvalue: flags & FLAG_RVALUE != 0,
        id,
        left: None,
        mid: None,
        right: None,
        left_id: child(ids[0]),
        mid_id: child(ids[1]),
        right_id: child(ids[2]),
        sym,
        name,
        value,
        line,
    }))
}

/// Streams finalised trees to the AST file, function by function.
pub struct AstWriter<W: Write> {
    out: W,
}

impl<W: Write> AstWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Serialise a whole tree in node-before-children order.
    pub fn write_tree(&mut self, tree: &Node) -> Result<()> {
        write_node(&mut self.out, tree)?;
        for child in [&tree.left, &tree.mid, &tree.right].into_iter().flatten() {
            self.write_tree(child)?;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Random-access loader over the AST file. On opening it makes one
/// sequential pass to build the index file (the node's offset stored
/// at byte `id * 8`) and the list of function-root offsets; after
/// that nodes are fetched by id through the index.
pub struct AstLoader {
    ast: BufReader<File>,
    idx: File,
    func_offsets: Vec<u64>,
    next_func: usize,
}

impl AstLoader {
    pub fn open(ast_path: &Path, idx_path: &Path) -> Result<Self> {
        let ast = BufReader::new(File::open(ast_path)?);
        let idx = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(idx_path)?;
        let mut loader = Self {
            ast,
            idx,
            func_offsets: Vec::new(),
            next_func: 0,
        };
        loader.build_index()?;
        Ok(loader)
    }

    fn build_index(&mut self) -> Result<()> {
        self.ast.seek(SeekFrom::Start(0))?;
        loop {
            let offset = self.ast.stream_position()?;
            let Some(node) = read_node(&mut self.ast)? else {
                break;
            };
            self.idx.seek(SeekFrom::Start(node.id.0 as u64 * 8))?;
            self.idx.write_u64(offset)?;
            if node.op == Op::Function {
                self.func_offsets.push(offset);
            }
        }
        self.idx.flush()?;
        Ok(())
    }

    fn load_at(&mut self, offset: u64) -> Result<Node> {
        self.ast.seek(SeekFrom::Start(offset))?;
        read_node(&mut self.ast)?.ok_or_else(|| anyhow!("Truncated AST file"))
    }

    /// Load the node with the given id through the index file.
    pub fn load_node(&mut self, id: NodeId) -> Result<Node> {
        self.idx.seek(SeekFrom::Start(id.0 as u64 * 8))?;
        let mut raw = [0u8; 8];
        use std::io::Read;
        self.idx.read_exact(&mut raw)?;
        let offset = u64::from_le_bytes(raw);
        let node = self.load_at(offset)?;
        if node.id != id {
            return Err(anyhow!(
                "Wanted AST node id {}, got {}",
                id.0,
                node.id.0
            ));
        }
        Ok(node)
    }

    /// Load an optional child by id.
    pub fn load_child(&mut self, id: Option<NodeId>) -> Result<Option<Node>> {
        id.map(|id| self.load_node(id)).transpose()
    }

    /// Load the next function's root node, or None when the AST file
    /// has no more functions.
    pub fn next_function(&mut self) -> Result<Option<Node>> {
        let Some(&offset) = self.func_offsets.get(self.next_func) else {
            return Ok(None);
        };
        self.next_func += 1;
        Ok(Some(self.load_at(offset)?))
    }
}
