//! Ordered insertion into a sorted vector.

use std::cmp::Ordering;

use super::PendingTask;

/// Queue order: earlier `created_at` first, then higher priority first.
pub fn task_order(a: &PendingTask, b: &PendingTask) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| b.priority.cmp(&a.priority))
}

/// Index at which `item` keeps `items` sorted.
///
/// Equal items stay in insertion order: the new item goes after every
/// existing item that compares equal. Appending is checked first since new
/// items usually sort last.
pub fn insertion_index<T, F>(items: &[T], item: &T, cmp: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    match items.last() {
        None => 0,
        Some(last) if cmp(last, item) != Ordering::Greater => items.len(),
        Some(_) => items.partition_point(|existing| cmp(existing, item) != Ordering::Greater),
    }
}

/// Insert `item` in sorted position and return its index.
pub fn ordered_insert<T, F>(items: &mut Vec<T>, item: T, cmp: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let index = insertion_index(items, &item, cmp);
    items.insert(index, item);
    index
}
