//! Document shapes for the attack sink. The storage itself is external;
//! only the canonical shapes and the hash contract live here, so that any
//! document store can deduplicate consistently.

use serde::Serialize;

use crate::hunt::analysis::AttackAnalysis;
use crate::hunt::attack::Attack;
use crate::opcode;
use crate::summary::StateVariable;

#[derive(Debug, Serialize)]
pub struct AttackDocument {
    /// keccak256(attackTx ∥ victimTx [∥ profitTx])
    pub hash: String,
    pub attacker: String,
    pub victim: String,
    pub attack_tx: String,
    pub victim_tx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_tx: Option<String>,
    pub block_number: u64,
    pub out_of_gas: bool,
    pub analyses: Vec<AnalysisDocument>,
}

#[derive(Debug, Serialize)]
pub struct AnalysisDocument {
    /// keccak256(attack-hash ∥ shared-variable-id)
    pub hash: String,
    pub pattern: &'static str,
    pub shared_variable: SharedVariableDocument,
    pub original_value: String,
    pub altered_value: String,
    pub influence_string: String,
    pub addressing_paths: Vec<Vec<AddressingStepDocument>>,
}

#[derive(Debug, Serialize)]
pub struct SharedVariableDocument {
    pub kind: &'static str,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddressingStepDocument {
    pub op: &'static str,
    pub pc: u64,
    pub code_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingredient: Option<String>,
}

impl AttackDocument {
    pub fn from_attack(attack: &Attack) -> Self {
        let hash = attack.hash();
        Self {
            hash: hash.to_string(),
            attacker: attack.attacker.to_string(),
            victim: attack.victim.to_string(),
            attack_tx: attack.attack_record.tx.hash().to_string(),
            victim_tx: attack.victim_record.tx.hash().to_string(),
            profit_tx: attack.profit_record.as_ref().map(|p| p.tx.hash().to_string()),
            block_number: attack.attack_record.block_number,
            out_of_gas: attack
                .victim_record
                .summary
                .as_ref()
                .map_or(false, |s| s.out_of_gas()),
            analyses: attack
                .analyses
                .iter()
                .map(|analysis| AnalysisDocument::from_analysis(analysis, attack))
                .collect(),
        }
    }
}

impl AnalysisDocument {
    pub fn from_analysis(analysis: &AttackAnalysis, attack: &Attack) -> Self {
        let shared_variable = match &analysis.shared_variable {
            StateVariable::Storage { address, slot, .. } => SharedVariableDocument {
                kind: "STORAGE",
                address: address.to_string(),
                slot: Some(slot.to_string()),
            },
            StateVariable::Balance { address, .. } => SharedVariableDocument {
                kind: "BALANCE",
                address: address.to_string(),
                slot: None,
            },
            StateVariable::Code { address, .. } => SharedVariableDocument {
                kind: "CODE",
                address: address.to_string(),
                slot: None,
            },
        };
        Self {
            hash: analysis.hash(attack.hash()).to_string(),
            pattern: analysis.pattern.as_str(),
            shared_variable,
            original_value: analysis.original_value.clone(),
            altered_value: analysis.altered_value.clone(),
            influence_string: analysis.influence_string.clone(),
            addressing_paths: analysis
                .addressing_paths
                .iter()
                .map(|path| {
                    path.0
                        .iter()
                        .map(|step| AddressingStepDocument {
                            op: opcode::name(step.op),
                            pc: step.pc,
                            code_addr: step.code_addr.to_string(),
                            operand: step.operand.map(|o| {
                                revm::primitives::B256::from(o).to_string()
                            }),
                            ingredient: step.ingredient.map(|i| {
                                revm::primitives::B256::from(i).to_string()
                            }),
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use revm::primitives::{keccak256, B256};

    use crate::hunt::attack::compute_attack_hash;

    #[test]
    fn attack_hash_contract() {
        let a = B256::with_last_byte(1);
        let v = B256::with_last_byte(2);
        let p = B256::with_last_byte(3);

        let mut two = Vec::new();
        two.extend_from_slice(a.as_slice());
        two.extend_from_slice(v.as_slice());
        assert_eq!(compute_attack_hash(a, v, None), keccak256(&two));

        let mut three = two.clone();
        three.extend_from_slice(p.as_slice());
        assert_eq!(compute_attack_hash(a, v, Some(p)), keccak256(&three));
        assert_ne!(compute_attack_hash(a, v, None), compute_attack_hash(a, v, Some(p)));
    }
}
