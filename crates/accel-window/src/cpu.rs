//! Host-side window execution for CPU kernels.

use rayon::prelude::*;

use crate::dimensions::{Coordinates, MAX_DIMS};
use crate::error::WindowError;
use crate::window::Window;

/// Position of a worker in a parallel window split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: usize,
    pub num_threads: usize,
}

/// Call `f` with every coordinate of `window`, x fastest.
///
/// Coordinates advance by each dimension's step. Nothing is visited if any
/// dimension is empty.
pub fn execute_window_loop<F>(window: &Window, mut f: F)
where
    F: FnMut(&Coordinates),
{
    if (0..MAX_DIMS).any(|dim| window[dim].is_empty()) {
        return;
    }
    let mut position = [0_i32; MAX_DIMS];
    for (dim, slot) in position.iter_mut().enumerate() {
        *slot = window[dim].start();
    }

    loop {
        f(&Coordinates::new(&position));

        let mut dim = 0;
        loop {
            if dim == MAX_DIMS {
                return;
            }
            position[dim] += window[dim].step();
            if position[dim] < window[dim].end() {
                break;
            }
            position[dim] = window[dim].start();
            dim += 1;
        }
    }
}

/// Split `window` along `split_dim` and run `f` on each part in parallel.
///
/// `num_threads == 0` uses the rayon pool size. The number of parts never
/// exceeds the number of iterations in `split_dim`.
pub fn run_parallel<F>(
    window: &Window,
    split_dim: usize,
    num_threads: usize,
    f: F,
) -> Result<(), WindowError>
where
    F: Fn(&Window, ThreadInfo) + Sync,
{
    let requested = if num_threads == 0 { rayon::current_num_threads() } else { num_threads };
    let threads = requested.clamp(1, window.num_iterations(split_dim).max(1));
    tracing::debug!(split_dim, threads, "splitting window across workers");

    (0..threads).into_par_iter().try_for_each(|thread_id| {
        let part = window.split_window(split_dim, thread_id, threads)?;
        f(&part, ThreadInfo { thread_id, num_threads: threads });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::window::Dimension;

    #[test]
    fn loop_visits_stepped_positions() {
        let mut w = Window::new();
        w.set(0, Dimension::new(0, 8, 4));
        w.set(1, Dimension::range(0, 3));
        let mut seen = Vec::new();
        execute_window_loop(&w, |c| seen.push((c[0], c[1])));
        assert_eq!(seen, vec![(0, 0), (4, 0), (0, 1), (4, 1), (0, 2), (4, 2)]);
    }

    #[test]
    fn loop_skips_empty_window() {
        let mut w = Window::new();
        w.set(1, Dimension::range(2, 2));
        let mut calls = 0;
        execute_window_loop(&w, |_| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn parallel_parts_cover_window_once() {
        let mut w = Window::new();
        w.set(0, Dimension::range(0, 4));
        w.set(1, Dimension::range(0, 37));
        let visited = AtomicUsize::new(0);
        let parts = Mutex::new(Vec::new());
        run_parallel(&w, Window::DIM_Y, 4, |part, info| {
            execute_window_loop(part, |_| {
                visited.fetch_add(1, Ordering::Relaxed);
            });
            parts.lock().unwrap().push((info.thread_id, part.y().start(), part.y().end()));
        })
        .unwrap();

        assert_eq!(visited.load(Ordering::Relaxed), 4 * 37);
        let mut parts = parts.into_inner().unwrap();
        parts.sort_unstable();
        assert_eq!(parts, vec![(0, 0, 10), (1, 10, 19), (2, 19, 28), (3, 28, 37)]);
    }

    #[test]
    fn thread_count_is_capped_by_iterations() {
        let mut w = Window::new();
        w.set(1, Dimension::range(0, 2));
        let calls = AtomicUsize::new(0);
        run_parallel(&w, Window::DIM_Y, 16, |_, info| {
            assert_eq!(info.num_threads, 2);
            calls.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
