//! Compression and solution of a system with a Cauchy type kernel.
//!
//! This example builds an H-matrix for the kernel $k(i, j) = 1 / (1 + |i - j|)$
//! plus a diagonal shift, applies it to a vector and solves a linear system
//! with the hierarchical LU decomposition.

use rusty_hmatrix::prelude::*;

// Two clusters are separated if their distance is at least the smaller size.
fn separated(row: (usize, usize), col: (usize, usize)) -> bool {
    let gap = if row.1 <= col.0 {
        col.0 - row.1
    } else if col.1 <= row.0 {
        row.0 - col.1
    } else {
        return false;
    };
    gap >= usize::min(row.1 - row.0, col.1 - col.0)
}

pub fn main() {
    // The matrix dimension and the maximum size of a leaf cluster.
    let n = 512;
    let leaf_size = 16;

    let tree = ClusterTree::bisection(n, leaf_size, separated).expect("Could not build the cluster tree.");

    // Tolerance and rank cap are passed explicitly with the tree.
    let ctx = Context::new(&tree, Options::new(1E-8, 40).unwrap());

    let kernel = |i: usize, j: usize| {
        if i == j {
            n as f64
        } else {
            1.0 / (1.0 + (i as f64 - j as f64).abs())
        }
    };

    let hmat = HMatrix::from_kernel(&ctx, &kernel).expect("Could not assemble the H-matrix.");

    println!(
        "H-matrix with {} blocks, maximum rank {}, compression ratio {:1.3}",
        hmat.len(),
        hmat.max_rank(),
        hmat.compression_ratio(&tree)
    );

    // Compare the H-matrix with the dense kernel matrix.
    let dense = DenseBlock::from_shape_fn(n, n, |(i, j)| kernel(i, j));
    let approx = hmat.to_dense(&tree).unwrap();
    println!(
        "Relative difference to the dense matrix is {:1.2E}",
        approx.view().rel_diff(dense.view())
    );

    // Solve A x = b with the LU factors.
    let factors = lu(&ctx, &hmat).expect("LU decomposition failed.");
    let rhs = DenseBlock::from_elem(n, 1, 1.0);
    let mut x = rhs.clone();
    lu_solve(&ctx, &factors, &mut x).unwrap();

    let residual = &dense * &x;
    println!(
        "Relative residual of the LU solve is {:1.2E}",
        residual.view().rel_diff(rhs.view())
    );
}
