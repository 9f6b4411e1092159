//! 8-connected component labeling.

/// Label the `true` pixels of a row-major mask with two-pass union-find.
///
/// Returns per-pixel labels (`0` = unset, components numbered `1..=count` in
/// raster order of their first pixel) and the component count.
pub(crate) fn label_components(mask: &[bool], width: usize, height: usize) -> (Vec<u32>, usize) {
    let mut labels = vec![0u32; width * height];
    // parent[0] is the background sentinel.
    let mut parent: Vec<u32> = vec![0];

    for row in 0..height {
        for col in 0..width {
            let idx = row * width + col;
            if !mask[idx] {
                continue;
            }
            // Already-visited neighbours: W, NW, N, NE.
            let mut neighbours = [0u32; 4];
            if col > 0 {
                neighbours[0] = labels[idx - 1];
            }
            if row > 0 {
                let up = idx - width;
                if col > 0 {
                    neighbours[1] = labels[up - 1];
                }
                neighbours[2] = labels[up];
                if col + 1 < width {
                    neighbours[3] = labels[up + 1];
                }
            }

            let smallest = neighbours.iter().copied().filter(|&l| l > 0).min();
            match smallest {
                None => {
                    let fresh = parent.len() as u32;
                    parent.push(fresh);
                    labels[idx] = fresh;
                }
                Some(min_label) => {
                    labels[idx] = min_label;
                    for &l in neighbours.iter().filter(|&&l| l > 0) {
                        union(&mut parent, min_label, l);
                    }
                }
            }
        }
    }

    // Resolve roots and renumber densely.
    let mut dense = vec![0u32; parent.len()];
    let mut count = 0u32;
    for label in labels.iter_mut().filter(|l| **l > 0) {
        let root = find(&mut parent, *label) as usize;
        if dense[root] == 0 {
            count += 1;
            dense[root] = count;
        }
        *label = dense[root];
    }
    (labels, count as usize)
}

/// Group pixel indices by label. Entry `k` holds the pixels of label `k + 1`.
pub(crate) fn group_pixels(labels: &[u32], count: usize) -> Vec<Vec<usize>> {
    let mut groups = vec![Vec::new(); count];
    for (idx, &l) in labels.iter().enumerate() {
        if l > 0 {
            groups[l as usize - 1].push(idx);
        }
    }
    groups
}

fn find(parent: &mut [u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        parent[x as usize] = parent[parent[x as usize] as usize];
        x = parent[x as usize];
    }
    x
}

fn union(parent: &mut [u32], a: u32, b: u32) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    // Lower root wins so labels stay in raster order.
    if ra < rb {
        parent[rb as usize] = ra;
    } else if rb < ra {
        parent[ra as usize] = rb;
    }
}
