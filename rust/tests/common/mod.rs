#![allow(dead_code)]

use ndarray::prelude::*;
use pmlcore::{EigenDecomposition, Model, PruningConfig, RateClasses, Session, TipData, Tree};

/// Symmetric two-state model Q = [[-1, 1], [1, -1]]
pub fn two_state() -> EigenDecomposition {
    EigenDecomposition::new(
        arr1(&[0.0, -2.0]),
        arr2(&[[1.0, 1.0], [1.0, -1.0]]),
        arr2(&[[0.5, 0.5], [0.5, -0.5]]),
    )
    .unwrap()
}

/// Closed-form transition probability of the two-state model.
pub fn two_state_p(from: usize, to: usize, t: f64) -> f64 {
    let e = (-2.0 * t).exp();
    if from == to {
        0.5 + 0.5 * e
    } else {
        0.5 - 0.5 * e
    }
}

/// Jukes-Cantor with unit expected rate
pub fn jukes_cantor() -> EigenDecomposition {
    let h = arr2(&[
        [1.0, 1.0, 1.0, 1.0],
        [1.0, -1.0, 1.0, -1.0],
        [1.0, 1.0, -1.0, -1.0],
        [1.0, -1.0, -1.0, 1.0],
    ]);
    let l = -4.0 / 3.0;
    EigenDecomposition::new(arr1(&[0.0, l, l, l]), h.clone(), h / 4.0).unwrap()
}

pub fn jc_model(classes: RateClasses) -> Model {
    Model::new(jukes_cantor(), Array1::from_elem(4, 0.25), classes).unwrap()
}

/// Two equally weighted rate classes averaging to one.
pub fn two_rates() -> RateClasses {
    RateClasses::new(arr1(&[0.5, 0.5]), arr1(&[0.4, 1.6])).unwrap()
}

/// Deterministic DNA-like codes with some gaps (code 4).
pub fn scrambled_codes(n_tips: usize, n_sites: usize) -> Array2<usize> {
    Array2::from_shape_fn((n_tips, n_sites), |(tip, site)| {
        let h = (tip * 7 + site * 13 + tip * site * 3 + 1) % 23;
        if h == 0 {
            4
        } else {
            h % 4
        }
    })
}

/// Codes mostly shared across tips, so branch lengths are identifiable.
pub fn related_codes(n_tips: usize, n_sites: usize) -> Array2<usize> {
    Array2::from_shape_fn((n_tips, n_sites), |(tip, site)| {
        let base = (site * 5 + 1) % 4;
        if (site + 3 * tip) % (tip + 4) == 0 {
            (base + tip + 1) % 4
        } else {
            base
        }
    })
}

pub fn dna_tips(codes: Array2<usize>) -> TipData {
    let n_sites = codes.ncols();
    let weights = Array1::from_shape_fn(n_sites, |s| 1.0 + (s % 3) as f64);
    TipData::new(TipData::identity_contrast(4), codes, weights).unwrap()
}

/// Caterpillar ((((1,2),3),4),...,n): internal node n + k joins node
/// n + k - 1 (or leaf 1) with leaf k + 1.
pub fn caterpillar(n_tips: usize) -> Tree {
    let mut edges = vec![(n_tips + 1, 1), (n_tips + 1, 2)];
    for k in 2..n_tips {
        let parent = n_tips + k;
        edges.push((parent, parent - 1));
        edges.push((parent, k + 1));
    }
    Tree::new(edges, n_tips).unwrap()
}

pub fn caterpillar_lengths(n_tips: usize) -> Vec<f64> {
    (0..2 * n_tips - 2).map(|i| 0.05 + 0.03 * (i % 5) as f64).collect()
}

/// Session on a JC caterpillar with the given number of tips and sites.
pub fn caterpillar_session(n_tips: usize, n_sites: usize, config: PruningConfig) -> Session {
    Session::new(
        jc_model(two_rates()),
        dna_tips(scrambled_codes(n_tips, n_sites)),
        caterpillar(n_tips),
        caterpillar_lengths(n_tips),
        config,
    )
    .unwrap()
}

/// ((1,2)6,3)7 and (4,5)8 joined at root 9.
pub fn balanced_five() -> (Tree, Vec<f64>) {
    let tree = Tree::new(
        vec![
            (6, 1),
            (6, 2),
            (7, 6),
            (7, 3),
            (8, 4),
            (8, 5),
            (9, 7),
            (9, 8),
        ],
        5,
    )
    .unwrap();
    (tree, vec![0.12, 0.3, 0.07, 0.22, 0.18, 0.09, 0.04, 0.11])
}
