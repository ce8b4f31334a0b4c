use bitcoin::{Transaction, Txid};

use crate::chain::{self, BlockAnchor, ChainBackend};
use crate::error::{Error, Result};
use crate::params::WaitConfig;
use crate::proof::ProofFile;
use crate::round::RoundRoot;
use crate::tree::{NodeOutput, RoundTree, RoundTreeNode};
use crate::wallet::AssetWallet;

/// Position of a node below the tree root: `L`/`R` steps from the top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodePath(String);

impl NodePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn left(&self) -> Self {
        Self(format!("{}L", self.0))
    }

    pub fn right(&self) -> Self {
        Self(format!("{}R", self.0))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            f.write_str("root")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// The published round root and its base proof file.
#[derive(Debug, Clone)]
pub struct RoundCommitment {
    pub txid: Txid,
    pub anchor: BlockAnchor,
    pub base_proof: ProofFile,
}

#[derive(Debug)]
pub struct NodeFailure {
    pub path: NodePath,
    pub txid: Txid,
    pub error: Error,
}

/// A leaf proof that was produced but not taken in by the receiving wallet.
/// The proof itself stays in [`ExitReport::proofs`].
#[derive(Debug)]
pub struct ImportFailure {
    pub path: NodePath,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct ExitReport {
    /// Leaf asset proof files, keyed by leaf position.
    pub proofs: Vec<(NodePath, ProofFile)>,
    pub failures: Vec<NodeFailure>,
    pub import_failures: Vec<ImportFailure>,
    pub broadcasts: usize,
}

impl ExitReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.import_failures.is_empty()
    }

    pub fn record_import_failure(&mut self, path: NodePath, error: Error) {
        log::warn!("settlement: import of leaf {path} failed: {error}");
        self.import_failures.push(ImportFailure { path, error });
    }

    fn merge(&mut self, other: ExitReport) {
        self.proofs.extend(other.proofs);
        self.failures.extend(other.failures);
        self.import_failures.extend(other.import_failures);
        self.broadcasts += other.broadcasts;
    }

    fn fail(&mut self, path: NodePath, txid: Txid, error: Error) {
        log::warn!("settlement: node {path} ({txid}) failed: {error}");
        self.failures.push(NodeFailure { path, txid, error });
    }
}

/// Publishes round transactions in dependency order and extends asset
/// proofs as they confirm.
pub struct SettlementWalker<'a> {
    chain: &'a dyn ChainBackend,
    assets: &'a dyn AssetWallet,
    wait: WaitConfig,
    parallel: bool,
}

impl<'a> SettlementWalker<'a> {
    pub fn new(chain: &'a dyn ChainBackend, assets: &'a dyn AssetWallet, wait: WaitConfig) -> Self {
        Self {
            chain,
            assets,
            wait,
            parallel: false,
        }
    }

    /// Walk sibling subtrees concurrently once their parent has confirmed.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Publish only the round root and append its transition proof to the
    /// boarding proof.
    pub fn commit_round(&self, root: &RoundRoot, boarding_proof: &ProofFile) -> Result<RoundCommitment> {
        let tx = root.transaction();
        let anchor = chain::publish(self.chain, tx, &self.wait)?;
        let base_proof =
            self.assets
                .append_transition_proof(boarding_proof, &root.transfer.proof_suffix, tx, &anchor)?;
        log::info!("settlement: round {} committed at height {}", root.transfer.txid(), anchor.height);
        Ok(RoundCommitment {
            txid: tx.compute_txid(),
            anchor,
            base_proof,
        })
    }

    /// Broadcast the whole tree top-down, extending `base_proof` along every
    /// path. Failures are recorded per node and only stop their own subtree.
    pub fn unilateral_exit(&self, tree: &mut RoundTree, base_proof: &ProofFile) -> ExitReport {
        let report = self.walk(&mut tree.root, NodePath::root(), base_proof);
        log::info!(
            "settlement: exit broadcast {} transactions, {} leaf proofs, {} failures",
            report.broadcasts,
            report.proofs.len(),
            report.failures.len()
        );
        report
    }

    fn walk(&self, node: &mut RoundTreeNode, path: NodePath, parent_proof: &ProofFile) -> ExitReport {
        let mut report = ExitReport::default();
        let txid = node.txid();

        let anchor = match self.chain.broadcast(&node.transaction) {
            Ok(_) => {
                report.broadcasts += 1;
                match chain::wait_for_confirmation(self.chain, &txid, &self.wait) {
                    Ok(anchor) => anchor,
                    Err(e) => {
                        report.fail(path, txid, e);
                        return report;
                    }
                }
            }
            Err(e) => {
                report.fail(path, txid, e);
                return report;
            }
        };

        if node.is_leaf() {
            let transaction = &node.transaction;
            let output = [&mut node.left_output, &mut node.right_output]
                .into_iter()
                .find(|o| o.kind == crate::tree::OutputKind::Asset);
            let Some(output) = output else {
                report.fail(path, txid, Error::Proof("leaf has no asset output".into()));
                return report;
            };
            match self.extend(output, parent_proof, transaction, &anchor) {
                Ok(file) => report.proofs.push((path, file)),
                Err(e) => report.fail(path, txid, e),
            }
            return report;
        }

        let RoundTreeNode {
            transaction,
            left_output,
            right_output,
            left_child,
            right_child,
            ..
        } = node;
        let left_proof = self.extend(left_output, parent_proof, transaction, &anchor);
        let right_proof = self.extend(right_output, parent_proof, transaction, &anchor);

        let left = (path.left(), left_child.as_deref_mut(), left_proof);
        let right = (path.right(), right_child.as_deref_mut(), right_proof);
        let (left_report, right_report) = if self.parallel {
            rayon::join(|| self.descend(left), || self.descend(right))
        } else {
            (self.descend(left), self.descend(right))
        };
        report.merge(left_report);
        report.merge(right_report);
        report
    }

    fn descend(
        &self,
        (path, child, proof): (NodePath, Option<&mut RoundTreeNode>, Result<ProofFile>),
    ) -> ExitReport {
        let mut report = ExitReport::default();
        let Some(child) = child else {
            return report;
        };
        match proof {
            Ok(proof) => self.walk(child, path, &proof),
            Err(e) => {
                report.fail(path, child.txid(), e);
                report
            }
        }
    }

    /// Append `output`'s transition proof to `parent` and record the result.
    fn extend(
        &self,
        output: &mut NodeOutput,
        parent: &ProofFile,
        tx: &Transaction,
        anchor: &BlockAnchor,
    ) -> Result<ProofFile> {
        let suffix = output.proof_suffix.as_ref().ok_or_else(|| {
            Error::Proof(format!(
                "output {}:{} has no transition proof",
                tx.compute_txid(),
                output.vout
            ))
        })?;
        let file = self.assets.append_transition_proof(parent, suffix, tx, anchor)?;
        output.proof = Some(file.clone());
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn node_path_display_and_depth() {
        let root = NodePath::root();
        assert_eq!(root.to_string(), "root");
        assert_eq!(root.depth(), 0);

        let path = root.left().right();
        assert_eq!(path.to_string(), "LR");
        assert_eq!(path.depth(), 2);
        assert!(root.left() < root.right());
    }

    #[test]
    fn report_is_complete_without_failures() {
        let mut report = ExitReport::default();
        assert!(report.is_complete());

        report.fail(
            NodePath::root().left(),
            Txid::all_zeros(),
            Error::Broadcast("rejected".into()),
        );
        assert!(!report.is_complete());
        assert_eq!(report.failures[0].path.to_string(), "L");

        let mut imports = ExitReport::default();
        imports.record_import_failure(NodePath::root().right(), Error::Proof("genesis".into()));
        assert!(imports.failures.is_empty());
        assert!(!imports.is_complete());
    }
}
