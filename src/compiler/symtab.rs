use std::collections::HashMap;

use crate::compiler::diagnostics::SrcLoc;
use crate::compiler::intern::Atom;
use crate::compiler::session::Session;
use crate::compiler::types::{StorageClass, TypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Var,
    Func,
    Typedef,
    EnumConst,
    Param,
}

#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub name: Atom,
    pub kind: SymKind,
    pub ty: TypeId,
    pub storage: StorageClass,
    pub enum_val: i64,
    pub is_defined: bool,
    pub is_local: bool,
    pub loc: SrcLoc,
}

#[derive(Debug, Clone, Copy)]
pub struct Label {
    pub name: Atom,
    pub defined: bool,
    pub loc: SrcLoc,
}

/// One lexical scope: ordinary identifiers and tags live in separate
/// namespaces, keyed by interned-string identity. Only function-body scopes
/// carry labels.
#[derive(Debug, Default)]
struct Scope {
    syms: HashMap<Atom, Symbol>,
    tags: HashMap<Atom, TypeId>,
    labels: Vec<Label>,
    is_func_scope: bool,
}

/// Stack of scopes. The file scope (index 0) persists for the whole
/// compilation; inner scopes are dropped on exit. Symbol and tag lookup climb
/// all scopes; label lookup climbs to the nearest enclosing function scope.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            scopes: vec![Scope::default()],
        }
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn leave_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Enter a scope that captures labels (a function body).
    pub fn enter_func_scope(&mut self) {
        self.enter_scope();
        if let Some(scope) = self.scopes.last_mut() {
            scope.is_func_scope = true;
        }
    }

    pub fn at_file_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    /// Define `name` in the current scope. Redefinition is an error, except
    /// redeclaring a function that has no body yet and redeclaring at extern
    /// linkage, both of which update the recorded type in place.
    pub fn define(
        &mut self,
        sess: &mut Session,
        name: Atom,
        kind: SymKind,
        ty: TypeId,
        loc: SrcLoc,
    ) -> &mut Symbol {
        let is_local = self.scopes.len() > 1;
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        if let Some(existing) = scope.syms.get(&name) {
            let redeclarable = (existing.kind == SymKind::Func
                && kind == SymKind::Func
                && !existing.is_defined)
                || existing.storage == StorageClass::Extern;
            if !redeclarable {
                let text = sess.interner.str(name).to_string();
                sess.error_at(loc, format!("redefinition of '{}'", text));
            }
            let slot = scope.syms.get_mut(&name).expect("entry just observed");
            if redeclarable {
                slot.ty = ty;
            }
            return slot;
        }
        scope.syms.insert(
            name,
            Symbol {
                name,
                kind,
                ty,
                storage: StorageClass::None,
                enum_val: 0,
                is_defined: false,
                is_local,
                loc,
            },
        );
        scope.syms.get_mut(&name).expect("entry just inserted")
    }

    pub fn lookup(&self, name: Atom) -> Option<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.syms.get(&name))
    }

    pub fn lookup_current(&self, name: Atom) -> Option<&Symbol> {
        self.scopes.last().and_then(|scope| scope.syms.get(&name))
    }

    pub fn define_tag(&mut self, name: Atom, ty: TypeId) {
        let scope = self.scopes.last_mut().expect("scope stack is never empty");
        scope.tags.insert(name, ty);
    }

    pub fn lookup_tag(&self, name: Atom) -> Option<TypeId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.tags.get(&name).copied())
    }

    pub fn lookup_tag_current(&self, name: Atom) -> Option<TypeId> {
        self.scopes
            .last()
            .and_then(|scope| scope.tags.get(&name).copied())
    }

    fn func_scope_mut(&mut self) -> &mut Scope {
        let idx = self
            .scopes
            .iter()
            .rposition(|s| s.is_func_scope)
            .unwrap_or(self.scopes.len() - 1);
        &mut self.scopes[idx]
    }

    fn func_scope(&self) -> &Scope {
        let idx = self
            .scopes
            .iter()
            .rposition(|s| s.is_func_scope)
            .unwrap_or(self.scopes.len() - 1);
        &self.scopes[idx]
    }

    pub fn define_label(&mut self, sess: &mut Session, name: Atom, loc: SrcLoc) {
        let scope = self.func_scope_mut();
        if let Some(label) = scope.labels.iter_mut().find(|l| l.name == name) {
            if label.defined {
                let text = sess.interner.str(name).to_string();
                sess.error_at(loc, format!("duplicate label '{}'", text));
            }
            label.defined = true;
            label.loc = loc;
            return;
        }
        scope.labels.push(Label {
            name,
            defined: true,
            loc,
        });
    }

    pub fn lookup_label(&self, name: Atom) -> Option<&Label> {
        self.func_scope().labels.iter().find(|l| l.name == name)
    }

    pub fn is_typedef(&self, name: Atom) -> bool {
        matches!(
            self.lookup(name),
            Some(Symbol {
                kind: SymKind::Typedef,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::types;

    fn loc(sess: &mut Session) -> SrcLoc {
        let file = sess.intern("test.c");
        SrcLoc::new(file, 1, 1)
    }

    #[test]
    fn inner_scopes_shadow_and_disappear() {
        let mut sess = Session::new();
        let at = loc(&mut sess);
        let name = sess.intern("x");
        let mut st = SymbolTable::new();
        st.define(&mut sess, name, SymKind::Var, types::INT, at);

        st.enter_scope();
        st.define(&mut sess, name, SymKind::Var, types::DOUBLE, at);
        assert_eq!(st.lookup(name).map(|s| s.ty), Some(types::DOUBLE));
        st.leave_scope();

        assert_eq!(st.lookup(name).map(|s| s.ty), Some(types::INT));
        assert_eq!(sess.diags.error_count(), 0);
    }

    #[test]
    fn redefinition_in_same_scope_is_an_error() {
        let mut sess = Session::new();
        let at = loc(&mut sess);
        let name = sess.intern("x");
        let mut st = SymbolTable::new();
        st.define(&mut sess, name, SymKind::Var, types::INT, at);
        st.define(&mut sess, name, SymKind::Var, types::INT, at);
        assert_eq!(sess.diags.error_count(), 1);
    }

    #[test]
    fn function_redeclaration_without_body_is_allowed() {
        let mut sess = Session::new();
        let at = loc(&mut sess);
        let name = sess.intern("f");
        let mut st = SymbolTable::new();
        st.define(&mut sess, name, SymKind::Func, types::INT, at);
        let sym = st.define(&mut sess, name, SymKind::Func, types::INT, at);
        sym.is_defined = true;
        assert_eq!(sess.diags.error_count(), 0);
    }

    #[test]
    fn labels_hoist_to_the_function_scope() {
        let mut sess = Session::new();
        let at = loc(&mut sess);
        let name = sess.intern("out");
        let mut st = SymbolTable::new();
        st.enter_func_scope();
        st.enter_scope();
        st.define_label(&mut sess, name, at);
        st.leave_scope();
        assert!(st.lookup_label(name).is_some());
    }

    #[test]
    fn typedef_probe_sees_shadowing() {
        let mut sess = Session::new();
        let at = loc(&mut sess);
        let name = sess.intern("T");
        let mut st = SymbolTable::new();
        let sym = st.define(&mut sess, name, SymKind::Typedef, types::INT, at);
        sym.storage = StorageClass::Typedef;
        assert!(st.is_typedef(name));

        st.enter_scope();
        st.define(&mut sess, name, SymKind::Var, types::INT, at);
        assert!(!st.is_typedef(name));
        st.leave_scope();
        assert!(st.is_typedef(name));
    }
}
