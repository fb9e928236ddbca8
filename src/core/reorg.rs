use std::collections::VecDeque;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// Reorgs deeper than this escalate from critical to emergency.
pub const ESCALATION_DEPTH: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderLink {
    pub height: u64,
    pub hash: String,
    pub prev_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorgSeverity {
    Critical,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgCheck {
    /// Block extends the known chain (or nothing is known to compare against).
    Linked,
    /// Parent mismatch, but every stored block still matches the node.
    TipReplaced { height: u64 },
    /// Genuine reorg: resume processing from `resume_height`.
    Reorg {
        height: u64,
        depth: u64,
        resume_height: u64,
        severity: ReorgSeverity,
    },
}

/// Rolling hash-chain consistency check over the last `capacity` blocks.
#[derive(Debug)]
pub struct ReorgDetector {
    history: VecDeque<HeaderLink>,
    capacity: usize,
}

impl ReorgDetector {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn hash_at(&self, height: u64) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|link| link.height == height)
            .map(|link| link.hash.as_str())
    }

    fn push(&mut self, link: HeaderLink) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(link);
    }

    /// Record `link` and report whether the chain it extends is consistent.
    ///
    /// When the block's parent differs from the stored hash at `height - 1`,
    /// stored heights are compared with `node_hash` walking backwards until
    /// they agree again. `depth` counts the incoming block plus every stored
    /// block the node no longer has, and processing resumes at
    /// `height - depth`.
    pub async fn check<F, Fut, E>(
        &mut self,
        link: HeaderLink,
        mut node_hash: F,
    ) -> Result<ReorgCheck, E>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let height = link.height;
        // replays (e.g. after a resume) overwrite what we had at that height
        self.history.retain(|l| l.height < height);

        let parent = height.checked_sub(1);
        let diverged = match (parent.and_then(|h| self.hash_at(h)), link.prev_hash.as_deref()) {
            (Some(stored), Some(prev)) => stored != prev,
            _ => false,
        };
        if !diverged {
            self.push(link);
            return Ok(ReorgCheck::Linked);
        }

        let mut fork_height = height;
        let mut cursor = parent;
        while let Some(h) = cursor {
            let Some(stored) = self.hash_at(h).map(str::to_string) else {
                break;
            };
            if node_hash(h).await? == stored {
                break;
            }
            fork_height = h;
            cursor = h.checked_sub(1);
        }

        let depth = height - fork_height + 1;
        if depth <= 1 {
            self.push(link);
            return Ok(ReorgCheck::TipReplaced { height });
        }

        let resume_height = height.saturating_sub(depth);
        self.history.retain(|l| l.height < resume_height);
        Ok(ReorgCheck::Reorg {
            height,
            depth,
            resume_height,
            severity: if depth > ESCALATION_DEPTH {
                ReorgSeverity::Emergency
            } else {
                ReorgSeverity::Critical
            },
        })
    }

    /// Stored hash for `height`, if still in the window.
    pub fn known_hash(&self, height: u64) -> Option<String> {
        self.hash_at(height).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::convert::Infallible;

    fn link(height: u64, hash: &str, prev: &str) -> HeaderLink {
        HeaderLink {
            height,
            hash: hash.to_string(),
            prev_hash: Some(prev.to_string()),
        }
    }

    /// Linear chain `tag1..=tagN`; heights below `from` keep the "h" prefix.
    fn chain(tag: &str, from: u64, n: u64) -> Vec<HeaderLink> {
        let name = |h: u64| {
            if h < from {
                format!("h{h}")
            } else {
                format!("{tag}{h}")
            }
        };
        (1..=n).map(|h| link(h, &name(h), &name(h - 1))).collect()
    }

    fn node_view(links: &[HeaderLink]) -> HashMap<u64, String> {
        links.iter().map(|l| (l.height, l.hash.clone())).collect()
    }

    async fn feed(
        detector: &mut ReorgDetector,
        link: HeaderLink,
        node: &HashMap<u64, String>,
    ) -> ReorgCheck {
        detector
            .check(link, |h| {
                let hash = node.get(&h).cloned().unwrap_or_default();
                async move { Ok::<_, Infallible>(hash) }
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn consistent_chain_is_linked() {
        let mut detector = ReorgDetector::new(10);
        let links = chain("h", 1, 20);
        let node = node_view(&links);
        for l in links {
            assert_eq!(feed(&mut detector, l, &node).await, ReorgCheck::Linked);
        }
        assert_eq!(detector.len(), 10);
    }

    #[tokio::test]
    async fn altered_parent_reports_reorg() {
        let mut detector = ReorgDetector::new(10);
        let mut blocks = chain("h", 1, 5);
        blocks[2].prev_hash = Some("x2".into());
        // the node now serves x2 at height 2
        let mut node = node_view(&blocks);
        node.insert(2, "x2".into());

        let mut reported = None;
        for l in blocks {
            if let ReorgCheck::Reorg { height, depth, resume_height, severity } =
                feed(&mut detector, l, &node).await
            {
                reported = Some((height, depth, resume_height, severity));
                break;
            }
        }
        let (height, depth, resume_height, severity) = reported.expect("reorg reported");
        assert!(height <= 5);
        assert!(depth >= 2);
        assert_eq!(resume_height, height - depth);
        assert_eq!(severity, ReorgSeverity::Critical);
    }

    #[tokio::test]
    async fn deep_fork_is_one_emergency() {
        let mut detector = ReorgDetector::new(10);
        let ours = chain("a", 6, 10);
        let node = node_view(&ours);
        for l in ours {
            feed(&mut detector, l, &node).await;
        }

        // the node switched to a branch forking after height 5
        let theirs = chain("b", 6, 12);
        let node = node_view(&theirs);
        let result = feed(&mut detector, theirs[10].clone(), &node).await;
        assert_eq!(
            result,
            ReorgCheck::Reorg {
                height: 11,
                depth: 6,
                resume_height: 5,
                severity: ReorgSeverity::Emergency,
            }
        );
        assert!(detector.known_hash(5).is_none());
        assert_eq!(detector.known_hash(4).as_deref(), Some("h4"));

        // replaying from the resume height links all the way up
        for l in theirs.into_iter().skip(4) {
            assert_eq!(feed(&mut detector, l, &node).await, ReorgCheck::Linked);
        }
        assert_eq!(detector.known_hash(6).as_deref(), Some("b6"));
    }

    #[tokio::test]
    async fn mismatch_the_node_does_not_confirm_is_tip_replaced() {
        let mut detector = ReorgDetector::new(10);
        let links = chain("h", 1, 4);
        let node = node_view(&links);
        for l in links {
            feed(&mut detector, l, &node).await;
        }
        assert_eq!(
            feed(&mut detector, link(5, "h5", "zz"), &node).await,
            ReorgCheck::TipReplaced { height: 5 }
        );
        assert_eq!(detector.known_hash(5).as_deref(), Some("h5"));
    }

    #[tokio::test]
    async fn node_errors_propagate() {
        let mut detector = ReorgDetector::new(10);
        for l in chain("h", 1, 3) {
            detector
                .check(l, |_| async { Ok::<String, &str>(String::new()) })
                .await
                .unwrap();
        }
        let err = detector
            .check(link(4, "x4", "x3"), |_| async { Err::<String, _>("node down") })
            .await
            .unwrap_err();
        assert_eq!(err, "node down");
    }

    #[tokio::test]
    async fn gap_in_history_is_not_a_reorg() {
        let mut detector = ReorgDetector::new(10);
        let node = HashMap::new();
        feed(&mut detector, link(1, "h1", "h0"), &node).await;
        assert_eq!(
            feed(&mut detector, link(5, "h5", "zz"), &node).await,
            ReorgCheck::Linked
        );
    }
}
