use aproxy_provider_core::{AffinityMap, ClientProvider, Pool};

#[test]
fn counts_follow_set_clear() {
    let map = AffinityMap::new();
    map.set("t1", ClientProvider::Google, Pool::Gemini, 0);
    map.set("t2", ClientProvider::Google, Pool::Gemini, 0);
    assert_eq!(map.active_count(Pool::Gemini, 0), 2);

    map.clear("t1", ClientProvider::Google);
    assert_eq!(map.active_count(Pool::Gemini, 0), 1);
    map.clear("t2", ClientProvider::Google);
    assert_eq!(map.active_count(Pool::Gemini, 0), 0);
}

#[test]
fn repinning_moves_the_count_atomically() {
    let map = AffinityMap::new();
    map.set("t1", ClientProvider::Google, Pool::Gemini, 0);
    map.set("t1", ClientProvider::Google, Pool::Antigravity, 1);

    assert_eq!(map.active_count(Pool::Gemini, 0), 0);
    assert_eq!(map.active_count(Pool::Antigravity, 1), 1);
}

#[test]
fn a_thread_holds_independent_pins_per_client_provider() {
    let map = AffinityMap::new();
    map.set("t1", ClientProvider::Google, Pool::Gemini, 0);
    map.set("t1", ClientProvider::Anthropic, Pool::Anthropic, 2);

    assert_eq!(
        map.peek("t1", ClientProvider::Google).unwrap().pool,
        Pool::Gemini
    );
    assert_eq!(
        map.peek("t1", ClientProvider::Anthropic).unwrap().account,
        2
    );
}

#[test]
fn expired_pins_are_evicted_on_read() {
    let map = AffinityMap::new();
    map.set("t1", ClientProvider::Openai, Pool::Codex, 0);
    map.backdate_for_tests("t1", ClientProvider::Openai, 3 * 60 * 60 * 1000);

    assert!(map.get("t1", ClientProvider::Openai).is_none());
    assert_eq!(map.active_count(Pool::Codex, 0), 0);
}

#[test]
fn get_touches_but_peek_does_not() {
    let map = AffinityMap::new();
    map.set("t1", ClientProvider::Openai, Pool::Codex, 0);
    map.backdate_for_tests("t1", ClientProvider::Openai, 60 * 60 * 1000);

    let stale_at = map.peek("t1", ClientProvider::Openai).unwrap().assigned_at;
    let touched_at = map.get("t1", ClientProvider::Openai).unwrap().assigned_at;
    assert!(touched_at > stale_at);
}

#[test]
fn sweep_evicts_stale_entries_and_counts() {
    let map = AffinityMap::new();
    map.set("t1", ClientProvider::Google, Pool::Gemini, 0);
    map.set("t2", ClientProvider::Google, Pool::Gemini, 0);
    map.backdate_for_tests("t1", ClientProvider::Google, 3 * 60 * 60 * 1000);

    assert_eq!(map.evict_expired(), 1);
    assert!(map.peek("t1", ClientProvider::Google).is_none());
    assert_eq!(map.active_count(Pool::Gemini, 0), 1);
}
