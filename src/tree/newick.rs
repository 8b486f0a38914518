use crate::error::Error;
use crate::error::Result;
use crate::tree::mapper::RtreeMapper;
use crate::tree::utree::HalfEdge;
use crate::tree::utree::Utree;

/// parsed newick subtree before unrooting
#[derive(Debug, Clone, Default)]
struct Ast {
    label: Option<String>,
    length: Option<f64>,
    children: Vec<Ast>,
}

impl Ast {
    fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    fn count_tips(&self) -> usize {
        // iterative; input trees can be deep
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_tip() {
                count += 1;
            } else {
                stack.extend(node.children.iter());
            }
        }
        count
    }
}

pub fn parse_file(path: &std::path::Path) -> Result<(Utree, RtreeMapper)> {
    let text = std::fs::read_to_string(path)?;
    parse(&text).map_err(|e| match e {
        Error::Parse { reason, .. } => Error::parse(path.to_string_lossy(), reason),
        other => other,
    })
}

/// parse a newick string into an unrooted tree. rooted inputs are unrooted
/// by merging the two root-adjacent edges, and the returned mapper records
/// how to translate placements back into the rooted numbering.
pub fn parse(text: &str) -> Result<(Utree, RtreeMapper)> {
    let root = parse_ast(text)?;
    validate(&root)?;

    match root.children.len() {
        3 => {
            let tree = build(root.children)?;
            Ok((tree, RtreeMapper::default()))
        }
        2 => unroot(root),
        n => Err(Error::parse(
            "newick",
            format!("root must have 2 or 3 children, found {n}"),
        )),
    }
}

fn parse_ast(text: &str) -> Result<Ast> {
    let err = |reason: &str| Error::parse("newick", reason);
    let mut stack: Vec<Vec<Ast>> = Vec::new();
    let mut cur: Option<Ast> = None;
    let mut done = false;

    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            c if c.is_whitespace() => i += 1,
            '[' => {
                // bracket comment, skipped
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                i += 1;
            }
            '(' => {
                if done {
                    return Err(err("content after the closing semicolon"));
                }
                stack.push(Vec::new());
                cur = None;
                i += 1;
            }
            ',' => {
                let node = cur.take().ok_or_else(|| err("empty child before ','"))?;
                stack
                    .last_mut()
                    .ok_or_else(|| err("',' outside of parentheses"))?
                    .push(node);
                i += 1;
            }
            ')' => {
                let node = cur.take().ok_or_else(|| err("empty child before ')'"))?;
                let mut children = stack.pop().ok_or_else(|| err("unbalanced ')'"))?;
                children.push(node);
                cur = Some(Ast {
                    children,
                    ..Default::default()
                });
                i += 1;
            }
            ':' => {
                i += 1;
                let start = i;
                while i < bytes.len() && !"(),;:[".contains(bytes[i] as char) {
                    i += 1;
                }
                let num = text[start..i].trim();
                let length: f64 = num
                    .parse()
                    .map_err(|_| err(&format!("malformed branch length '{num}'")))?;
                cur.as_mut()
                    .ok_or_else(|| err("branch length without a node"))?
                    .length = Some(length);
            }
            ';' => {
                if !stack.is_empty() {
                    return Err(err("unbalanced '(' at the semicolon"));
                }
                done = true;
                i += 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() && !"(),;:[".contains(bytes[i] as char) {
                    i += 1;
                }
                let label = text[start..i].trim().to_string();
                match cur.as_mut() {
                    // label of a just-closed inner node, ignored downstream
                    Some(node) if node.label.is_none() => node.label = Some(label),
                    Some(_) => return Err(err("two labels on one node")),
                    None => {
                        cur = Some(Ast {
                            label: Some(label),
                            ..Default::default()
                        })
                    }
                }
            }
        }
    }

    if !done {
        return Err(err("missing trailing semicolon"));
    }
    cur.ok_or_else(|| err("empty tree"))
}

fn validate(root: &Ast) -> Result<()> {
    let mut stack = vec![(root, true)];
    while let Some((node, is_root)) = stack.pop() {
        let arity = node.children.len();
        if !node.is_tip() {
            let ok = if is_root { arity == 2 || arity == 3 } else { arity == 2 };
            if !ok {
                return Err(Error::parse(
                    "newick",
                    "tree contains multifurcations (polytomies)",
                ));
            }
            stack.extend(node.children.iter().map(|c| (c, false)));
        } else if node.label.is_none() {
            return Err(Error::parse("newick", "tip without a label"));
        }
    }
    if root.count_tips() < 3 {
        return Err(Error::parse("newick", "number of tip nodes too small"));
    }
    Ok(())
}

/// turn a rooted AST into an unrooted tree plus the edge-number translation
fn unroot(mut root: Ast) -> Result<(Utree, RtreeMapper)> {
    let right = root.children.pop().unwrap();
    let left = root.children.pop().unwrap();
    let l_len = left.length.unwrap_or(crate::DEFAULT_BRANCH_LENGTH);
    let r_len = right.length.unwrap_or(crate::DEFAULT_BRANCH_LENGTH);
    let merged = l_len + r_len;

    // is the top-level trifurcation placed on the left subtree?
    let uroot_left = !left.is_tip();

    let (top_children, proximal_length, distal_length) = if uroot_left {
        let mut l_children = left.children;
        let mut r = right;
        r.length = Some(merged);
        let c2 = l_children.pop().unwrap();
        let c1 = l_children.pop().unwrap();
        (vec![c1, c2, r], l_len, r_len)
    } else {
        // left child is a tip, so the right must carry the trifurcation
        if right.is_tip() {
            return Err(Error::parse("newick", "number of tip nodes too small"));
        }
        let mut l = left;
        l.length = Some(merged);
        let mut r_children = right.children;
        let c2 = r_children.pop().unwrap();
        let c1 = r_children.pop().unwrap();
        (vec![l, c1, c2], r_len, l_len)
    };

    let tree = build(top_children)?;

    // walk the unrooted numbering while counting rooted postorder ids to
    // recover the translation table
    fn extend(tree: &Utree, h: usize, translation: &mut Vec<usize>, rooted_index: &mut usize) {
        for _ in tree.postorder_subtree(h) {
            translation.push(*rooted_index);
            *rooted_index += 1;
        }
    }

    let mut translation: Vec<usize> = Vec::new();
    let mut rooted_index = 0usize;

    let t0 = tree.vroot;
    let t1 = tree.next(t0);
    let t2 = tree.next(t1);

    let (utree_root_edge, rtree_proximal_edge, rtree_distal_edge) = if uroot_left {
        extend(&tree, tree.back(t0), &mut translation, &mut rooted_index);
        extend(&tree, tree.back(t1), &mut translation, &mut rooted_index);
        // the edge above the left child exists only in the rooted tree
        let proximal = rooted_index;
        rooted_index += 1;
        extend(&tree, tree.back(t2), &mut translation, &mut rooted_index);
        let distal = *translation.last().unwrap();
        (translation.len() - 1, proximal, distal)
    } else {
        extend(&tree, tree.back(t0), &mut translation, &mut rooted_index);
        extend(&tree, tree.back(t1), &mut translation, &mut rooted_index);
        extend(&tree, tree.back(t2), &mut translation, &mut rooted_index);
        // one surplus rooted id for the edge above the right child
        let proximal = rooted_index;
        (0, proximal, 0)
    };

    let mapper = RtreeMapper::new(
        utree_root_edge,
        rtree_proximal_edge,
        rtree_distal_edge,
        proximal_length,
        distal_length,
        uroot_left,
        translation,
    );
    Ok((tree, mapper))
}

/// assemble the half-edge arena from the three top-level subtrees
fn build(top_children: Vec<Ast>) -> Result<Utree> {
    assert_eq!(top_children.len(), 3);
    let tip_count: usize = top_children.iter().map(|c| c.count_tips()).sum();
    let inner_count = tip_count - 2;
    let total = tip_count + 3 * inner_count;

    let dummy = HalfEdge {
        back: usize::MAX,
        next: None,
        clv_index: 0,
        scaler_index: None,
        pmatrix_index: 0,
        length: f64::NAN,
        label: None,
    };
    let mut halves = vec![dummy; total];

    let mut next_tip = 0usize;
    let mut next_ring = tip_count;

    let mut alloc_ring = |halves: &mut Vec<HalfEdge>| {
        let base = next_ring;
        next_ring += 3;
        halves[base].next = Some(base + 1);
        halves[base + 1].next = Some(base + 2);
        halves[base + 2].next = Some(base);
        base
    };

    let top = alloc_ring(&mut halves);

    let mut stack: Vec<(Ast, usize)> = Vec::new();
    for (slot, child) in top_children.into_iter().enumerate().rev() {
        stack.push((child, top + slot));
    }

    while let Some((node, parent_half)) = stack.pop() {
        let length = node.length.unwrap_or(f64::NAN);
        let up = if node.is_tip() {
            let tip = next_tip;
            next_tip += 1;
            halves[tip].label = node.label.clone();
            tip
        } else {
            let base = alloc_ring(&mut halves);
            let mut children = node.children;
            let c2 = children.pop().unwrap();
            let c1 = children.pop().unwrap();
            stack.push((c2, base + 2));
            stack.push((c1, base + 1));
            base
        };
        halves[up].back = parent_half;
        halves[parent_half].back = up;
        halves[up].length = length;
        halves[parent_half].length = length;
    }

    assert_eq!(next_tip, tip_count);
    assert_eq!(next_ring, total);

    // per-direction CLVs: the arena index doubles as the clv index
    for h in 0..total {
        halves[h].clv_index = h;
        halves[h].scaler_index = if h < tip_count {
            None
        } else {
            Some(h - tip_count)
        };
    }

    let mut tree = Utree {
        halves,
        tip_count,
        inner_count,
        vroot: top,
    };
    tree.set_missing_branch_lengths(crate::DEFAULT_BRANCH_LENGTH);
    tree.assign_pmatrix_indices();
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unrooted_tree_without_mapper() {
        let (tree, mapper) = parse("(A:0.1,B:0.2,(C:0.3,D:0.4):0.5);").unwrap();
        assert_eq!(tree.tip_count, 4);
        assert!(!mapper.is_active());
    }

    #[test]
    fn parses_rooted_tree_with_mapper() {
        let (tree, mapper) = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        assert_eq!(tree.tip_count, 4);
        assert_eq!(tree.edge_count(), 5);
        assert!(mapper.is_active());
        assert!(mapper.uroot_is_left());
    }

    #[test]
    fn rooted_left_tip_puts_trifurcation_right() {
        let (tree, mapper) = parse("(A:0.1,(B:0.2,(C:0.3,D:0.4):0.5):0.6);").unwrap();
        assert_eq!(tree.tip_count, 4);
        assert!(mapper.is_active());
        assert!(!mapper.uroot_is_left());
        assert!(mapper.is_utree_root_edge(0));
    }

    #[test]
    fn merged_root_edge_sums_both_lengths() {
        let (tree, mapper) = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        let branches = tree.query_branches();
        // the merged edge carries the summed root-adjacent lengths
        let merged = branches
            .iter()
            .map(|&h| tree.halves[h].length)
            .find(|&l| (l - 0.9).abs() < 1e-12);
        assert!(merged.is_some());
        let (_, distal_len) = mapper.distal_of_utree_root();
        assert!((distal_len - 0.6).abs() < 1e-12);
    }

    #[test]
    fn rejects_multifurcations() {
        assert!(parse("((A:1,B:1,C:1):1,(D:1,E:1):1);").is_err());
    }

    #[test]
    fn rejects_tiny_and_malformed_input() {
        assert!(parse("(A:1,B:1);").is_err());
        assert!(parse("(A:1,B:1,C:1)").is_err());
        assert!(parse("not a tree").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn missing_lengths_get_defaults() {
        let (tree, _) = parse("(A,B,(C,D));").unwrap();
        for h in tree.query_branches() {
            assert!(tree.halves[h].length > 0.0);
        }
    }

    #[test]
    fn rooted_mapping_covers_all_unrooted_edges() {
        let (tree, mapper) = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);").unwrap();
        for id in 0..tree.edge_count() {
            let (rooted, _) = mapper.in_rtree(id, 0.0);
            // rooted tree has one more edge than the unrooted one
            assert!(rooted < tree.edge_count() + 1);
        }
    }
}
