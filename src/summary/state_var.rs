//! State variables read or written by a transaction: storage slots,
//! account balances and account code.
//!
//! Identity (`same`) ignores the value; full equality also compares it.

use revm::primitives::{Address, Bytes, B256, U256};

use crate::opcode;
use crate::tracing::location::TraceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateVarKind {
    Storage,
    Balance,
    Code,
}

#[derive(Debug, Clone)]
pub enum StateVariable {
    Storage {
        address: Address,
        slot: B256,
        value: B256,
        /// None when defined/used by the transaction itself (e.g. the
        /// sender balance debit).
        location: Option<TraceLocation>,
    },
    Balance {
        address: Address,
        value: U256,
        location: Option<TraceLocation>,
    },
    Code {
        address: Address,
        /// The opcode that observed the code (CODESIZE, EXTCODEHASH, ...).
        op: u8,
        code: Option<Bytes>,
        size: Option<usize>,
        hash: Option<B256>,
        location: Option<TraceLocation>,
    },
}

impl StateVariable {
    pub fn kind(&self) -> StateVarKind {
        match self {
            StateVariable::Storage { .. } => StateVarKind::Storage,
            StateVariable::Balance { .. } => StateVarKind::Balance,
            StateVariable::Code { .. } => StateVarKind::Code,
        }
    }

    pub fn address(&self) -> Address {
        match self {
            StateVariable::Storage { address, .. }
            | StateVariable::Balance { address, .. }
            | StateVariable::Code { address, .. } => *address,
        }
    }

    /// Stable identifier; the value does not participate.
    pub fn id(&self) -> String {
        match self {
            StateVariable::Storage { address, slot, .. } => format!("{address}:{slot}"),
            StateVariable::Balance { address, .. } => format!("{address}:balance"),
            StateVariable::Code { address, .. } => format!("{address}:code"),
        }
    }

    pub fn location(&self) -> Option<&TraceLocation> {
        match self {
            StateVariable::Storage { location, .. }
            | StateVariable::Balance { location, .. }
            | StateVariable::Code { location, .. } => location.as_ref(),
        }
    }

    /// Same variable, ignoring values.
    pub fn same(&self, other: &StateVariable) -> bool {
        match (self, other) {
            (
                StateVariable::Storage { address: a, slot: s, .. },
                StateVariable::Storage { address: b, slot: t, .. },
            ) => a == b && s == t,
            (StateVariable::Balance { address: a, .. }, StateVariable::Balance { address: b, .. }) => {
                a == b
            }
            (StateVariable::Code { address: a, .. }, StateVariable::Code { address: b, .. }) => a == b,
            _ => false,
        }
    }

    /// Same variable with the same value.
    pub fn equal(&self, other: &StateVariable) -> bool {
        if !self.same(other) {
            return false;
        }
        match (self, other) {
            (StateVariable::Storage { value: a, .. }, StateVariable::Storage { value: b, .. }) => {
                a == b
            }
            (StateVariable::Balance { value: a, .. }, StateVariable::Balance { value: b, .. }) => {
                a == b
            }
            (
                StateVariable::Code { code: c1, size: s1, hash: h1, .. },
                StateVariable::Code { code: c2, size: s2, hash: h2, .. },
            ) => c1 == c2 && s1 == s2 && h1 == h2,
            _ => false,
        }
    }

    pub fn storage(address: Address, slot: B256, value: B256, location: Option<TraceLocation>) -> Self {
        StateVariable::Storage { address, slot, value, location }
    }

    pub fn balance(address: Address, value: U256, location: Option<TraceLocation>) -> Self {
        StateVariable::Balance { address, value, location }
    }

    pub fn code_size(address: Address, op: u8, size: usize, location: Option<TraceLocation>) -> Self {
        StateVariable::Code { address, op, code: None, size: Some(size), hash: None, location }
    }

    pub fn code_bytes(address: Address, op: u8, code: Bytes, location: Option<TraceLocation>) -> Self {
        StateVariable::Code { address, op, code: Some(code), size: None, hash: None, location }
    }

    pub fn code_hash(address: Address, hash: B256, location: Option<TraceLocation>) -> Self {
        StateVariable::Code {
            address,
            op: opcode::EXTCODEHASH,
            code: None,
            size: None,
            hash: Some(hash),
            location,
        }
    }
}

/// An ordered set of state variables with identity-based operations.
#[derive(Debug, Clone, Default)]
pub struct StateVariables(pub Vec<StateVariable>);

impl StateVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateVariable> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Insert, replacing an existing entry for the same variable.
    pub fn add_with_override(&mut self, vars: impl IntoIterator<Item = StateVariable>) {
        for var in vars {
            if let Some(existing) = self.0.iter_mut().find(|e| e.same(&var)) {
                *existing = var;
            } else {
                self.0.push(var);
            }
        }
    }

    /// Insert only variables not already present.
    pub fn add_if_absent(&mut self, vars: impl IntoIterator<Item = StateVariable>) {
        for var in vars {
            if !self.0.iter().any(|e| e.same(&var)) {
                self.0.push(var);
            }
        }
    }

    /// Pairs (from self, from other) of variables present in both sets.
    pub fn intersect_with<'a>(
        &'a self,
        other: &'a StateVariables,
    ) -> Vec<(&'a StateVariable, &'a StateVariable)> {
        let mut pairs = Vec::new();
        for v in &self.0 {
            for o in &other.0 {
                if v.same(o) {
                    pairs.push((v, o));
                }
            }
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_ignores_value() {
        let a = StateVariable::storage(Address::ZERO, B256::ZERO, B256::with_last_byte(1), None);
        let b = StateVariable::storage(Address::ZERO, B256::ZERO, B256::with_last_byte(2), None);
        assert!(a.same(&b));
        assert!(!a.equal(&b));
    }

    #[test]
    fn override_replaces_in_place() {
        let mut vars = StateVariables::new();
        vars.add_with_override([StateVariable::balance(Address::ZERO, U256::from(1), None)]);
        vars.add_with_override([StateVariable::balance(Address::ZERO, U256::from(2), None)]);
        assert_eq!(vars.len(), 1);
        match &vars.0[0] {
            StateVariable::Balance { value, .. } => assert_eq!(*value, U256::from(2)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn add_if_absent_keeps_first() {
        let mut vars = StateVariables::new();
        vars.add_if_absent([StateVariable::balance(Address::ZERO, U256::from(1), None)]);
        vars.add_if_absent([StateVariable::balance(Address::ZERO, U256::from(2), None)]);
        assert_eq!(vars.len(), 1);
        match &vars.0[0] {
            StateVariable::Balance { value, .. } => assert_eq!(*value, U256::from(1)),
            _ => unreachable!(),
        }
    }
}
