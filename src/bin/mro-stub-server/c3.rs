//! C3 linearization over the classes of one document.
//!
//! Bases that are not defined in the document are treated as direct
//! subclasses of `object`. A base list that cannot be merged yields the
//! part of the chain merged before the conflict.

use crate::scan::ClassDef;

const OBJECT: &str = "object";

/// Resolution order of every class in `classes`, index for index.
pub fn linearize_all(classes: &[ClassDef]) -> Vec<Vec<String>> {
    let mut linearizer = Linearizer {
        classes,
        memo: vec![None; classes.len()],
        in_progress: vec![false; classes.len()],
    };
    (0..classes.len()).map(|i| linearizer.mro(i)).collect()
}

struct Linearizer<'a> {
    classes: &'a [ClassDef],
    memo: Vec<Option<Vec<String>>>,
    in_progress: Vec<bool>,
}

impl Linearizer<'_> {
    fn mro(&mut self, index: usize) -> Vec<String> {
        if let Some(done) = &self.memo[index] {
            return done.clone();
        }
        let classes = self.classes;
        let class = &classes[index];
        if self.in_progress[index] {
            // inheritance cycle
            return vec![class.name.clone(), OBJECT.to_string()];
        }
        self.in_progress[index] = true;

        let mut chain = vec![class.name.clone()];
        if class.bases.is_empty() {
            chain.push(OBJECT.to_string());
        } else {
            let mut sequences: Vec<Vec<String>> = class
                .bases
                .iter()
                .map(|base| self.base_mro(base, index))
                .collect();
            sequences.push(class.bases.clone());
            let name = &class.name;
            chain.extend(merge(sequences).into_iter().filter(|n| n != name));
        }

        self.in_progress[index] = false;
        self.memo[index] = Some(chain.clone());
        chain
    }

    fn base_mro(&mut self, base: &str, referrer: usize) -> Vec<String> {
        match self.resolve(base, referrer) {
            Some(index) => self.mro(index),
            None if base == OBJECT => vec![OBJECT.to_string()],
            None => vec![base.to_string(), OBJECT.to_string()],
        }
    }

    /// The definition a base name refers to: the closest one above the
    /// referring class, else the first one below it.
    fn resolve(&self, name: &str, referrer: usize) -> Option<usize> {
        let matches = |i: &usize| self.classes[*i].name == name;
        (0..referrer)
            .rev()
            .find(matches)
            .or_else(|| (referrer + 1..self.classes.len()).find(matches))
    }
}

/// The C3 merge. Stops at the first step where no head is free.
fn merge(mut sequences: Vec<Vec<String>>) -> Vec<String> {
    let mut merged = Vec::new();
    loop {
        sequences.retain(|seq| !seq.is_empty());
        if sequences.is_empty() {
            return merged;
        }

        let candidate = sequences.iter().map(|seq| &seq[0]).find(|head| {
            !sequences
                .iter()
                .any(|seq| seq[1..].iter().any(|name| name == *head))
        });
        let Some(head) = candidate.cloned() else {
            return merged;
        };

        for seq in &mut sequences {
            if seq[0] == head {
                seq.remove(0);
            }
        }
        merged.push(head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::scan;

    fn chains(source: &str) -> Vec<Vec<String>> {
        linearize_all(&scan(source))
    }

    #[test]
    fn test_diamond() {
        let source = concat!(
            "class A(Generic[T]): pass\n",
            "class B(A): pass\n",
            "class C(A): pass\n",
            "class D(B, C): pass\n",
        );
        assert_eq!(
            chains(source),
            vec![
                vec!["A", "Generic", "object"],
                vec!["B", "A", "Generic", "object"],
                vec!["C", "A", "Generic", "object"],
                vec!["D", "B", "C", "A", "Generic", "object"],
            ]
        );
    }

    #[test]
    fn test_no_bases_and_explicit_object() {
        assert_eq!(
            chains("class A: pass\nclass B(object): pass\n"),
            vec![vec!["A", "object"], vec!["B", "object"]]
        );
    }

    #[test]
    fn test_conflict_stops_at_merged_prefix() {
        let source = "class O: pass\nclass A(O): pass\nclass B(A): pass\nclass C(A, B): pass\n";
        let chains = chains(source);
        assert_eq!(chains[2], vec!["B", "A", "O", "object"]);
        assert_eq!(chains[3], vec!["C"]);
    }

    #[test]
    fn test_forward_reference_and_cycle() {
        assert_eq!(
            chains("class B(A): pass\nclass A: pass\n")[0],
            vec!["B", "A", "object"]
        );
        let cyclic = chains("class A(B): pass\nclass B(A): pass\n");
        assert_eq!(cyclic[0], vec!["A", "B", "object"]);
    }

    #[test]
    fn test_complex_hierarchy() {
        // the classic example from the C3 paper
        let source = concat!(
            "class O: pass\n",
            "class F(O): pass\n",
            "class E(O): pass\n",
            "class D(O): pass\n",
            "class C(D, F): pass\n",
            "class B(D, E): pass\n",
            "class A(B, C): pass\n",
        );
        assert_eq!(
            chains(source)[6],
            vec!["A", "B", "C", "D", "E", "F", "O", "object"]
        );
    }
}
