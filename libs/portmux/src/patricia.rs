//! Compressed trie (patricia tree) over a fixed set of byte strings.
//!
//! Built once and immutable afterwards. Matching reads at most as many bytes
//! as the longest candidate into a scratch buffer owned by the matcher, so a
//! match attempt never allocates.
//!
//! The scratch buffer is shared by every caller and guarded by an async
//! mutex: concurrent connections matching against the same instance take
//! turns. That serialisation is the price of zero per-call allocation; if a
//! single matcher becomes contended, switch to a per-call buffer (or a pool
//! of them) in [`PatriciaMatcher::read_and_match`].

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

/// How a candidate must line up with the bytes read from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Succeed as soon as a candidate is consistent with the leading bytes.
    Prefix,
    /// The bytes read must equal a candidate exactly.
    Exact,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Node {
    prefix: Vec<u8>,
    terminal: bool,
    next: HashMap<u8, Node>,
}

impl Node {
    fn build(mut candidates: Vec<&[u8]>) -> Self {
        if candidates.len() == 1 {
            return Self {
                prefix: candidates[0].to_vec(),
                terminal: true,
                next: HashMap::new(),
            };
        }

        let common = common_prefix_len(&candidates);
        let mut node = Self {
            prefix: candidates[0][..common].to_vec(),
            ..Self::default()
        };

        let mut groups: HashMap<u8, Vec<&[u8]>> = HashMap::new();
        for candidate in candidates.drain(..) {
            match candidate[common..].split_first() {
                None => node.terminal = true,
                Some((first, rest)) => groups.entry(*first).or_default().push(rest),
            }
        }

        node.next = groups
            .into_iter()
            .map(|(first, rests)| (first, Self::build(rests)))
            .collect();
        node
    }
}

fn common_prefix_len(candidates: &[&[u8]]) -> usize {
    let Some((first, others)) = candidates.split_first() else {
        return 0;
    };
    let mut len = first.len();
    for other in others {
        len = len.min(
            first
                .iter()
                .zip(other.iter())
                .take_while(|(a, b)| a == b)
                .count(),
        );
    }
    len
}

/// Patricia tree matcher for literal byte-string membership and prefix tests.
#[derive(Debug)]
pub struct PatriciaMatcher {
    root: Node,
    max_len: usize,
    scratch: Mutex<Vec<u8>>,
}

impl PatriciaMatcher {
    /// Build a matcher from a set of candidates.
    ///
    /// Duplicates are ignored and the order of `candidates` does not affect
    /// the resulting tree. An empty set never matches.
    pub fn new<I, B>(candidates: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut owned: Vec<Vec<u8>> = candidates
            .into_iter()
            .map(|c| c.as_ref().to_vec())
            .collect();
        owned.sort();
        owned.dedup();

        let max_len = owned.iter().map(Vec::len).max().unwrap_or(0);
        let root = if owned.is_empty() {
            Node::default()
        } else {
            Node::build(owned.iter().map(Vec::as_slice).collect())
        };

        Self {
            root,
            max_len,
            scratch: Mutex::new(vec![0u8; max_len]),
        }
    }

    /// Length of the longest candidate, i.e. the most bytes a match reads.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Match candidates against `input` without reading anything.
    pub fn match_bytes(&self, mut input: &[u8], mode: MatchMode) -> bool {
        let mut node = &self.root;
        loop {
            let l = node.prefix.len().min(input.len());
            if input[..l] != node.prefix[..l] {
                return false;
            }

            if node.terminal && (mode == MatchMode::Prefix || node.prefix.len() == input.len()) {
                return true;
            }

            // Input ran out inside or right after this node's prefix.
            if l == input.len() {
                return false;
            }

            match node.next.get(&input[l]) {
                Some(child) => {
                    node = child;
                    input = &input[l + 1..];
                }
                None => return false,
            }
        }
    }

    /// Read up to [`max_len`](Self::max_len) bytes and test whether a
    /// candidate is consistent with them.
    pub async fn match_prefix<R>(&self, reader: &mut R) -> bool
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.read_and_match(reader, MatchMode::Prefix).await
    }

    /// Read up to [`max_len`](Self::max_len) bytes and test whether they
    /// equal a candidate.
    pub async fn match_exact<R>(&self, reader: &mut R) -> bool
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.read_and_match(reader, MatchMode::Exact).await
    }

    async fn read_and_match<R>(&self, reader: &mut R, mode: MatchMode) -> bool
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut scratch = self.scratch.lock().await;
        let n = read_up_to(reader, &mut scratch[..]).await;
        self.match_bytes(&scratch[..n], mode)
    }
}

/// Fill `buf` as far as the reader allows. EOF and I/O errors end the read
/// early; matching then works with whatever arrived.
async fn read_up_to<R>(reader: &mut R, buf: &mut [u8]) -> usize
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}
