pub mod record;

use anyhow::{anyhow, bail, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::target::Target;
use crate::types::{type_size, Prim};

/// Unique id of a symbol; ids start at 1 and are the cross-reference
/// keys used by the AST file and by composite-type links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SymId(pub u32);

/// What kind of entity a symbol is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[repr(u8)]
pub enum SymKind {
    Variable = 0,
    Function,
    Array,
    EnumValue,
    StrLit,
    Struct,
    Union,
    EnumType,
    Typedef,
}

impl SymKind {
    /// Struct, union, enum and typedef symbols live in the type list.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            SymKind::Struct | SymKind::Union | SymKind::EnumType | SymKind::Typedef
        )
    }
}

/// Visibility class of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Serialize)]
#[repr(u8)]
pub enum SymClass {
    Global = 0,
    Extern,
    Static,
    Local,
    Param,
    Member,
}

/// One symbol table entry. The `posn` field is reused per kind: the
/// end label for functions, the string label for string literals, the
/// frame offset for locals and parameters, the member offset for
/// struct members, and the value for enum values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sym {
    pub name: String,
    pub id: SymId,
    pub prim: Prim,
    pub ctype: Option<SymId>,
    pub kind: SymKind,
    pub class: SymClass,
    pub size: i64,
    pub nelems: i64,
    pub variadic: bool,
    pub has_addr: bool,
    pub posn: i64,
    pub init_list: Option<Vec<i32>>,
    /// Members of a composite, or a function's parameters followed by
    /// its locals.
    pub members: Vec<Sym>,
}

/// The symbol table: one list for variables, functions and string
/// literals, a parallel list for types, and an accumulation list that
/// collects the members of whatever composite or parameter list is
/// currently being declared.
#[derive(Debug)]
pub struct SymTab {
    pub globals: Vec<Sym>,
    pub types: Vec<Sym>,
    membs: Vec<Sym>,
    next_id: u32,
    target: Target,
    /// Index into `globals` of the function whose body is being
    /// processed, if any.
    cur_fn: Option<usize>,
}

impl SymTab {
    pub fn new(target: Target) -> Self {
        Self {
            globals: Vec::new(),
            types: Vec::new(),
            membs: Vec::new(),
            next_id: 0,
            target,
            cur_fn: None,
        }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    fn new_sym(
        &mut self,
        name: &str,
        prim: Prim,
        ctype: Option<SymId>,
        kind: SymKind,
        class: SymClass,
        nelems: i64,
        posn: i64,
    ) -> Result<Sym> {
        self.next_id += 1;

        // Scalars and pointers size themselves; composites copy the
        // size from the composite type's symbol.
        let size = if prim.is_ptr() || prim.is_int() {
            nelems * type_size(prim, None, self.target)?
        } else if prim.is_composite() {
            let ctype = ctype.and_then(|id| self.find_by_id(id));
            ctype.map(|c| c.size).unwrap_or(0)
        } else {
            0
        };

        Ok(Sym {
            name: name.to_owned(),
            id: SymId(self.next_id),
            prim,
            ctype,
            kind,
            class,
            size,
            nelems,
            variadic: false,
            has_addr: false,
            posn,
            init_list: None,
            members: Vec::new(),
        })
    }

    /// Add a variable, function, array or string literal to the
    /// global list. Returns its id.
    pub fn add_global(
        &mut self,
        name: &str,
        prim: Prim,
        ctype: Option<SymId>,
        kind: SymKind,
        class: SymClass,
        nelems: i64,
        posn: i64,
    ) -> Result<SymId> {
        let sym = self.new_sym(name, prim, ctype, kind, class, nelems, posn)?;
        let id = sym.id;
        self.globals.push(sym);
        Ok(id)
    }

    /// Add a local variable to the current function.
    pub fn add_local(
        &mut self,
        name: &str,
        prim: Prim,
        ctype: Option<SymId>,
        kind: SymKind,
        nelems: i64,
    ) -> Result<SymId> {
        let sym = self.new_sym(name, prim, ctype, kind, SymClass::Local, nelems, 0)?;
        let id = sym.id;
        let f = self
            .cur_fn
            .ok_or_else(|| anyhow!("Local declaration outside a function"))?;
        self.globals[f].members.push(sym);
        Ok(id)
    }

    /// Add a parameter to the accumulation list.
    pub fn add_parameter(
        &mut self,
        name: &str,
        prim: Prim,
        ctype: Option<SymId>,
    ) -> Result<SymId> {
        let sym = self.new_sym(
            name,
            prim,
            ctype,
            SymKind::Variable,
            SymClass::Param,
            1,
            0,
        )?;
        let id = sym.id;
        self.membs.push(sym);
        Ok(id)
    }

    /// Add a composite member to the accumulation list.
    pub fn add_member(
        &mut self,
        name: &str,
        prim: Prim,
        ctype: Option<SymId>,
        kind: SymKind,
        nelems: i64,
    ) -> Result<SymId> {
        let sym = self.new_sym(name, prim, ctype, kind, SymClass::Member, nelems, 0)?;
        let id = sym.id;
        self.membs.push(sym);
        Ok(id)
    }

    fn add_type(&mut self, name: &str, prim: Prim, kind: SymKind, posn: i64) -> Result<SymId> {
        let sym = self.new_sym(name, prim, None, kind, SymClass::Global, 0, posn)?;
        let id = sym.id;
        self.types.push(sym);
        Ok(id)
    }

    pub fn add_struct(&mut self, name: &str) -> Result<SymId> {
        self.add_type(name, Prim::STRUCT, SymKind::Struct, 0)
    }

    pub fn add_union(&mut self, name: &str) -> Result<SymId> {
        self.add_type(name, Prim::UNION, SymKind::Union, 0)
    }

    pub fn add_enum_type(&mut self, name: &str) -> Result<SymId> {
        self.add_type(name, Prim::INT, SymKind::EnumType, 0)
    }

    pub fn add_enum_value(&mut self, name: &str, value: i64) -> Result<SymId> {
        self.add_type(name, Prim::INT, SymKind::EnumValue, value)
    }

    pub fn add_typedef(&mut self, name: &str, prim: Prim, ctype: Option<SymId>) -> Result<SymId> {
        let sym = self.new_sym(name, prim, ctype, SymKind::Typedef, SymClass::Global, 0, 0)?;
        let id = sym.id;
        self.types.push(sym);
        Ok(id)
    }

    /// Detach the accumulated member list, for attachment to the
    /// owning composite or function.
    pub fn take_members(&mut self) -> Vec<Sym> {
        std::mem::take(&mut self.membs)
    }

    /// Name lookup in the accumulation list, used while a composite is
    /// being declared.
    pub fn find_member(&self, name: &str) -> Option<&Sym> {
        self.membs.iter().find(|s| s.name == name)
    }

    /// Enter a function body: locals added from here attach to the
    /// named function.
    pub fn enter_function(&mut self, id: SymId) -> Result<()> {
        let idx = self
            .globals
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| anyhow!("Unknown function symbol id {}", id.0))?;
        self.cur_fn = Some(idx);
        Ok(())
    }

    pub fn current_function(&self) -> Option<&Sym> {
        self.cur_fn.map(|i| &self.globals[i])
    }

    pub fn current_function_mut(&mut self) -> Option<&mut Sym> {
        self.cur_fn.map(|i| &mut self.globals[i])
    }

    /// Leave the current function scope. Its parameters and locals
    /// stay attached to the function symbol for serialisation.
    pub fn free_local_symbols(&mut self) {
        self.cur_fn = None;
        self.membs.clear();
    }

    /// Remove file-scope static symbols from the table.
    pub fn free_static_symbols(&mut self) {
        self.globals.retain(|s| s.class != SymClass::Static);
    }

    /// Search the current function's parameters and locals.
    pub fn find_local(&self, name: &str) -> Option<&Sym> {
        let f = self.current_function()?;
        f.members.iter().find(|s| s.name == name)
    }

    /// Name lookup for a variable, function or string literal:
    /// first the current function's scope, then the global list.
    pub fn find_symbol(&self, name: &str) -> Option<&Sym> {
        self.find_local(name)
            .or_else(|| self.globals.iter().find(|s| s.name == name))
    }

    pub fn find_global(&self, name: &str) -> Option<&Sym> {
        self.globals.iter().find(|s| s.name == name)
    }

    pub fn find_global_mut(&mut self, name: &str) -> Option<&mut Sym> {
        self.globals.iter_mut().find(|s| s.name == name)
    }

    fn find_type(&self, name: &str, kind: SymKind) -> Option<&Sym> {
        self.types
            .iter()
            .find(|s| s.kind == kind && s.name == name)
    }

    pub fn find_struct(&self, name: &str) -> Option<&Sym> {
        self.find_type(name, SymKind::Struct)
    }

    pub fn find_union(&self, name: &str) -> Option<&Sym> {
        self.find_type(name, SymKind::Union)
    }

    pub fn find_enum_type(&self, name: &str) -> Option<&Sym> {
        self.find_type(name, SymKind::EnumType)
    }

    pub fn find_enum_value(&self, name: &str) -> Option<&Sym> {
        self.find_type(name, SymKind::EnumValue)
    }

    pub fn find_typedef(&self, name: &str) -> Option<&Sym> {
        self.find_type(name, SymKind::Typedef)
    }

    /// Id lookup over every symbol in the table, members included.
    pub fn find_by_id(&self, id: SymId) -> Option<&Sym> {
        fn search(list: &[Sym], id: SymId) -> Option<&Sym> {
            for sym in list {
                if sym.id == id {
                    return Some(sym);
                }
                if let Some(found) = search(&sym.members, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&self.globals, id).or_else(|| search(&self.types, id))
    }

    pub fn must_find_by_id(&self, id: SymId) -> Result<&Sym> {
        self.find_by_id(id)
            .ok_or_else(|| anyhow!("Can't find symbol with id {}", id.0))
    }

    pub fn find_by_id_mut(&mut self, id: SymId) -> Option<&mut Sym> {
        fn search(list: &mut [Sym], id: SymId) -> Option<&mut Sym> {
            for sym in list.iter_mut() {
                if sym.id == id {
                    return Some(sym);
                }
                if let Some(found) = search(&mut sym.members, id) {
                    return Some(found);
                }
            }
            None
        }
        search(&mut self.globals, id).or_else(|| search(&mut self.types, id))
    }

    /// Mark that a symbol's address is taken somewhere in the AST.
    pub fn set_has_addr(&mut self, id: SymId) -> Result<()> {
        fn search(list: &mut [Sym], id: SymId) -> bool {
            for sym in list {
                if sym.id == id {
                    sym.has_addr = true;
                    return true;
                }
                if search(&mut sym.members, id) {
                    return true;
                }
            }
            false
        }
        if search(&mut self.globals, id) || search(&mut self.types, id) {
            Ok(())
        } else {
            bail!("Can't find symbol with id {}", id.0)
        }
    }

    /// Replace a top-level symbol, identified by id, with an updated
    /// copy. Used by the generator to write back frame layouts.
    pub fn replace(&mut self, sym: Sym) -> Result<()> {
        let slot = self
            .globals
            .iter_mut()
            .find(|s| s.id == sym.id)
            .ok_or_else(|| anyhow!("Can't find symbol with id {}", sym.id.0))?;
        *slot = sym;
        Ok(())
    }
}
