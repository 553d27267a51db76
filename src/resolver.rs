//! Symbol resolution across a kext and its transitive dependencies.
//!
//! Kext dependency graphs are not trees; `IOUSBHostFamily` and the like are
//! depended on from all over the place, and prelinked kexts can even form
//! cycles through weak links. Rather than materialise a visited set for
//! every query, each kext carries a `processed` flag that a query sets on
//! entry and that the outermost call clears globally on the way out.

use std::cell::Cell;

use crate::macho::symtab::Nlist64;
use crate::macho::MachContext;
use crate::vtable::PrelinkedVtable;

/// Whether a symbol query should range over the whole linked symbol table
/// or just its trailing C++ slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolFilter {
    Any,
    CxxOnly,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkedSymbol<'a> {
    pub name: Option<&'a str>,
    pub nlist: Nlist64,
}

impl<'a> LinkedSymbol<'a> {
    pub fn value(&self) -> u64 {
        self.nlist.n_value
    }
}

/// In-memory record for one bundle extracted from the prelinked kernel.
pub struct PrelinkedKext<'a> {
    pub identifier: String,
    /// The resolved symbol table produced during prelinking, with all C++
    /// symbols as a trailing slice.
    pub linked_symbols: Vec<LinkedSymbol<'a>>,
    pub num_cxx_symbols: usize,
    /// Back-pointers (indices into the owning [`KextPool`]) to this kext's
    /// transitive dependencies, in declared order.
    pub dependencies: Vec<usize>,
    pub macho: MachContext<'a>,
    pub vtables: Vec<PrelinkedVtable<'a>>,
    processed: Cell<bool>,
}

impl<'a> PrelinkedKext<'a> {
    pub fn new(
        identifier: String,
        linked_symbols: Vec<LinkedSymbol<'a>>,
        num_cxx_symbols: usize,
        dependencies: Vec<usize>,
        macho: MachContext<'a>,
    ) -> Self {
        PrelinkedKext {
            identifier,
            linked_symbols,
            num_cxx_symbols,
            dependencies,
            macho,
            vtables: Vec::new(),
            processed: Cell::new(false),
        }
    }

    pub fn cxx_symbols(&self) -> &[LinkedSymbol<'a>] {
        let start = self.linked_symbols.len().saturating_sub(self.num_cxx_symbols);
        &self.linked_symbols[start..]
    }

    fn symbols_for(&self, filter: SymbolFilter) -> &[LinkedSymbol<'a>] {
        match filter {
            SymbolFilter::Any => &self.linked_symbols,
            SymbolFilter::CxxOnly => self.cxx_symbols(),
        }
    }
}

/// Owns every kext in a single prelink session; dependency edges between
/// kexts are indices into this pool, never ownership links, so the graph
/// can be cyclic without anything needing `Rc`/`RefCell`.
#[derive(Default)]
pub struct KextPool<'a> {
    pub kexts: Vec<PrelinkedKext<'a>>,
}

impl<'a> KextPool<'a> {
    pub fn push(&mut self, kext: PrelinkedKext<'a>) -> usize {
        self.kexts.push(kext);
        self.kexts.len() - 1
    }

    fn unlock_all(&self) {
        for kext in &self.kexts {
            kext.processed.set(false);
        }
    }

    /// Looks up `name` in `start`'s own symbol table, then in each of its
    /// dependencies in order, skipping any dependency already marked
    /// `processed` to short-circuit cycles.
    pub fn find_by_name(&self, start: usize, name: &str, filter: SymbolFilter) -> Option<(usize, LinkedSymbol<'a>)> {
        let result = self.find_by_name_worker(start, name, filter);
        self.unlock_all();
        result
    }

    fn find_by_name_worker(&self, index: usize, name: &str, filter: SymbolFilter) -> Option<(usize, LinkedSymbol<'a>)> {
        let kext = &self.kexts[index];
        kext.processed.set(true);

        for sym in kext.symbols_for(filter) {
            if sym.name == Some(name) {
                return Some((index, *sym));
            }
        }

        for &dep in &kext.dependencies {
            if self.kexts[dep].processed.get() {
                continue;
            }
            if let Some(found) = self.find_by_name_worker(dep, name, filter) {
                return Some(found);
            }
        }

        None
    }

    /// Mirror image of [`Self::find_by_name`]: returns the first symbol in
    /// `start` or one of its dependencies whose address equals `value`.
    pub fn find_by_value(&self, start: usize, value: u64, filter: SymbolFilter) -> Option<(usize, LinkedSymbol<'a>)> {
        let result = self.find_by_value_worker(start, value, filter);
        self.unlock_all();
        result
    }

    fn find_by_value_worker(&self, index: usize, value: u64, filter: SymbolFilter) -> Option<(usize, LinkedSymbol<'a>)> {
        let kext = &self.kexts[index];
        kext.processed.set(true);

        for sym in kext.symbols_for(filter) {
            if sym.value() == value {
                return Some((index, *sym));
            }
        }

        for &dep in &kext.dependencies {
            if self.kexts[dep].processed.get() {
                continue;
            }
            if let Some(found) = self.find_by_value_worker(dep, value, filter) {
                return Some(found);
            }
        }

        None
    }

    pub fn get(&self, index: usize) -> &PrelinkedKext<'a> {
        &self.kexts[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut PrelinkedKext<'a> {
        &mut self.kexts[index]
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Option<usize> {
        self.kexts.iter().position(|k| k.identifier == identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::header::Header64;

    fn fake_context() -> MachContext<'static> {
        // A resolver test only needs the pool's bookkeeping, not a real
        // Mach-O; build the smallest possible valid buffer once and leak
        // it so the context's lifetime is 'static for the test.
        static BUF: [u8; 32] = {
            let mut b = [0u8; 32];
            b[0] = 0xcf;
            b[1] = 0xfa;
            b[2] = 0xed;
            b[3] = 0xfe;
            b[4] = 7; // CPU_TYPE_X86
            b[5] = 0;
            b[6] = 0;
            b[7] = 1; // | CPU_ARCH_ABI64
            b[16] = 2; // MH_EXECUTE
            b
        };
        MachContext::parse(&BUF).unwrap()
    }

    fn sym(name: &'static str, value: u64) -> LinkedSymbol<'static> {
        LinkedSymbol {
            name: Some(name),
            nlist: Nlist64 {
                n_strx: 0,
                n_type: 0x1,
                n_sect: 1,
                n_desc: 0,
                n_value: value,
            },
        }
    }

    #[test]
    fn finds_symbol_in_dependency() {
        let mut pool = KextPool::default();
        let dep = PrelinkedKext::new(
            "com.example.dep".into(),
            vec![sym("_dependency_fn", 0x1000)],
            0,
            vec![],
            fake_context(),
        );
        let dep_idx = pool.push(dep);
        let top = PrelinkedKext::new(
            "com.example.top".into(),
            vec![sym("_top_fn", 0x2000)],
            0,
            vec![dep_idx],
            fake_context(),
        );
        let top_idx = pool.push(top);

        let found = pool.find_by_name(top_idx, "_dependency_fn", SymbolFilter::Any);
        assert_eq!(found.map(|(_, s)| s.value()), Some(0x1000));

        // processed flags must be cleared after the query completes
        assert!(!pool.kexts[top_idx].processed.get());
        assert!(!pool.kexts[dep_idx].processed.get());
    }

    #[test]
    fn cyclic_dependencies_terminate() {
        let mut pool = KextPool::default();
        let a = pool.push(PrelinkedKext::new("A".into(), vec![], 0, vec![], fake_context()));
        let b = pool.push(PrelinkedKext::new(
            "B".into(),
            vec![sym("_only_in_b", 42)],
            0,
            vec![a],
            fake_context(),
        ));
        pool.get_mut(a).dependencies.push(b);

        let found = pool.find_by_name(a, "_only_in_b", SymbolFilter::Any);
        assert_eq!(found.map(|(_, s)| s.value()), Some(42));
    }

    #[test]
    fn cxx_only_filter_skips_leading_symbols() {
        let mut pool = KextPool::default();
        let kext = PrelinkedKext::new(
            "com.example.cxx".into(),
            vec![sym("_c_symbol", 1), sym("__ZN9IOService5startEv", 2)],
            1,
            vec![],
            fake_context(),
        );
        let idx = pool.push(kext);

        assert!(pool.find_by_name(idx, "_c_symbol", SymbolFilter::CxxOnly).is_none());
        assert!(pool
            .find_by_name(idx, "__ZN9IOService5startEv", SymbolFilter::CxxOnly)
            .is_some());
    }
}
