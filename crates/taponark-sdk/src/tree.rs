use bitcoin::{Amount, Transaction, Txid};

use crate::proof::{ProofFile, TransitionProof};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Branch,
    Leaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A leaf's asset payout.
    Asset,
    /// A leaf's plain bitcoin payout.
    Btc,
    /// A branch output funding a child subtree.
    CombinedAssetAndBtc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub kind: OutputKind,
    /// Index in the node's transaction.
    pub vout: u32,
    pub asset_amount: u64,
    pub btc_amount: Amount,
    /// Partial transition proof for asset-carrying outputs.
    pub proof_suffix: Option<TransitionProof>,
    /// Full proof file, set once the exit walk has confirmed the node.
    pub proof: Option<ProofFile>,
}

/// One pre-signed transaction of the settlement tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTreeNode {
    pub kind: NodeKind,
    pub transaction: Transaction,
    pub left_output: NodeOutput,
    pub right_output: NodeOutput,
    pub left_child: Option<Box<RoundTreeNode>>,
    pub right_child: Option<Box<RoundTreeNode>>,
}

impl RoundTreeNode {
    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub fn outputs(&self) -> [&NodeOutput; 2] {
        [&self.left_output, &self.right_output]
    }

    /// The leaf's asset payout, if this is a leaf.
    pub fn asset_output(&self) -> Option<&NodeOutput> {
        self.outputs()
            .into_iter()
            .find(|o| self.is_leaf() && o.kind == OutputKind::Asset)
    }
}

/// The settlement tree below a round root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTree {
    pub root: Box<RoundTreeNode>,
    pub level: u32,
}

impl RoundTree {
    /// Pre-order traversal: a node always precedes its descendants, which is
    /// also a valid broadcast order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: vec![self.root.as_ref()],
        }
    }

    pub fn leaves(&self) -> impl Iterator<Item = &RoundTreeNode> {
        self.iter().filter(|n| n.is_leaf())
    }

    /// Every output of every node, in traversal order.
    pub fn outputs(&self) -> impl Iterator<Item = &NodeOutput> {
        self.iter().flat_map(|n| n.outputs())
    }

    pub fn branch_count(&self) -> usize {
        self.iter().filter(|n| !n.is_leaf()).count()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().count()
    }

    /// Leaf asset proofs collected by an exit walk.
    pub fn leaf_proofs(&self) -> impl Iterator<Item = &ProofFile> {
        self.leaves()
            .filter_map(|n| n.asset_output())
            .filter_map(|o| o.proof.as_ref())
    }
}

pub struct Iter<'a> {
    stack: Vec<&'a RoundTreeNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a RoundTreeNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        if let Some(right) = node.right_child.as_deref() {
            self.stack.push(right);
        }
        if let Some(left) = node.left_child.as_deref() {
            self.stack.push(left);
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, TxOut};

    fn output(kind: OutputKind, vout: u32) -> NodeOutput {
        NodeOutput {
            kind,
            vout,
            asset_amount: 1,
            btc_amount: Amount::from_sat(1_000),
            proof_suffix: None,
            proof: None,
        }
    }

    fn tx(tag: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(tag),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn node(level: u32, tag: &mut u64) -> RoundTreeNode {
        *tag += 1;
        let transaction = tx(*tag);
        if level == 0 {
            return RoundTreeNode {
                kind: NodeKind::Leaf,
                transaction,
                left_output: output(OutputKind::Asset, 1),
                right_output: output(OutputKind::Btc, 2),
                left_child: None,
                right_child: None,
            };
        }
        RoundTreeNode {
            kind: NodeKind::Branch,
            transaction,
            left_output: output(OutputKind::CombinedAssetAndBtc, 0),
            right_output: output(OutputKind::CombinedAssetAndBtc, 1),
            left_child: Some(Box::new(node(level - 1, tag))),
            right_child: Some(Box::new(node(level - 1, tag))),
        }
    }

    #[test]
    fn counts_by_level() {
        for level in 0..4 {
            let tree = RoundTree {
                root: Box::new(node(level, &mut 0)),
                level,
            };
            assert_eq!(tree.leaf_count(), 1 << level);
            assert_eq!(tree.branch_count(), (1 << level) - 1);
            assert_eq!(tree.outputs().count(), 2 * tree.iter().count());
        }
    }

    #[test]
    fn iteration_is_pre_order() {
        let tree = RoundTree {
            root: Box::new(node(2, &mut 0)),
            level: 2,
        };
        // Tags were assigned in pre-order during construction.
        let tags: Vec<u64> = tree
            .iter()
            .map(|n| n.transaction.output[0].value.to_sat())
            .collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn leaf_asset_output() {
        let leaf = node(0, &mut 0);
        assert_eq!(leaf.asset_output().map(|o| o.vout), Some(1));
        assert!(node(1, &mut 0).asset_output().is_none());
    }
}
