// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use criterion::{criterion_group, criterion_main, Criterion};
use dtrie::DomainTrie;

fn bench_longest_match(c: &mut Criterion) {
    let mut trie = DomainTrie::new();
    for i in 0..50_000u32 {
        trie.insert(&format!("host{}.tracker{}.example.com", i, i % 977), i);
    }
    trie.insert("example.com", 0);

    c.bench_function("longest_match", |b| {
        b.iter(|| {
            assert_eq!(
                trie.longest_match("a.host42.tracker42.example.com"),
                Some((4, &42))
            )
        })
    });
}

criterion_group!(benches, bench_longest_match);
criterion_main!(benches);
