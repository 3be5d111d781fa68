mod common;

use authority_core::events::PermissionEvent;
use authority_core::manager::PermissionManager;
use common::test_manager;

const PLAYER_A: &str = "00000000-0000-0000-0000-00000000000a";
const PLAYER_B: &str = "00000000-0000-0000-0000-00000000000b";
const PLAYER_C: &str = "00000000-0000-0000-0000-00000000000c";

#[test]
fn direct_grant_resolves() {
    let manager = test_manager();
    assert!(manager.create_group("admin", "administrators"));
    assert!(manager.set_group_priority("admin", 100));
    assert!(manager.register_permission("world.edit", "edit the world", false));
    assert!(manager.add_permission_to_group("admin", "world.edit"));
    assert!(manager.add_player_to_group(PLAYER_A, "admin", None));

    assert!(manager.has_permission(PLAYER_A, "world.edit"));
    assert!(!manager.has_permission(PLAYER_A, "world.delete"));
    manager.shutdown();
}

#[test]
fn higher_priority_denial_wins() {
    let manager = test_manager();
    assert!(manager.create_group("base", ""));
    assert!(manager.set_group_priority("base", 10));
    assert!(manager.add_permission_to_group("base", "chat.*"));
    assert!(manager.create_group("mute", ""));
    assert!(manager.set_group_priority("mute", 20));
    assert!(manager.add_permission_to_group("mute", "-chat.send"));

    assert!(manager.add_player_to_group(PLAYER_B, "base", None));
    assert!(manager.add_player_to_group(PLAYER_B, "mute", None));

    assert!(!manager.has_permission(PLAYER_B, "chat.send"));
    assert!(manager.has_permission(PLAYER_B, "chat.receive"));
    manager.shutdown();
}

#[test]
fn same_node_follows_priority_order() {
    let manager = test_manager();
    assert!(manager.create_group("low", ""));
    assert!(manager.set_group_priority("low", 10));
    assert!(manager.add_permission_to_group("low", "night.vision"));
    assert!(manager.create_group("high", ""));
    assert!(manager.set_group_priority("high", 20));
    assert!(manager.add_permission_to_group("high", "-night.vision"));

    assert!(manager.add_player_to_group(PLAYER_B, "low", None));
    assert!(manager.add_player_to_group(PLAYER_B, "high", None));
    assert!(!manager.has_permission(PLAYER_B, "night.vision"));

    // Swapping the order swaps the outcome once invalidation runs.
    assert!(manager.set_group_priority("low", 30));
    assert!(manager.has_permission(PLAYER_B, "night.vision"));
    manager.shutdown();
}

#[test]
fn longest_pattern_wins() {
    let manager = test_manager();
    assert!(manager.create_group("g", ""));
    assert!(manager.add_permission_to_group("g", "-a.*"));
    assert!(manager.add_permission_to_group("g", "a.b.*"));
    assert!(manager.add_player_to_group(PLAYER_A, "g", None));

    assert!(manager.has_permission(PLAYER_A, "a.b.c"));
    assert!(!manager.has_permission(PLAYER_A, "a.x"));
    manager.shutdown();
}

#[test]
fn inherited_rules_apply_until_edge_removed() {
    let manager = test_manager();
    assert!(manager.create_group("parent", ""));
    assert!(manager.add_permission_to_group("parent", "fly"));
    assert!(manager.create_group("child", ""));
    assert!(manager.add_group_inheritance("child", "parent"));
    assert!(manager.add_player_to_group(PLAYER_C, "child", None));

    assert!(manager.has_permission(PLAYER_C, "fly"));
    let ancestors = manager.all_ancestor_groups("child");
    assert_eq!(ancestors, vec!["parent".to_string()]);
    assert_eq!(manager.direct_parent_groups("child"), vec!["parent".to_string()]);

    assert!(manager.remove_group_inheritance("child", "parent"));
    assert!(!manager.has_permission(PLAYER_C, "fly"));
    assert!(manager.all_ancestor_groups("child").is_empty());
    manager.shutdown();
}

#[test]
fn cycles_are_rejected() {
    let manager = test_manager();
    assert!(manager.create_group("a", ""));
    assert!(manager.create_group("b", ""));

    assert!(manager.add_group_inheritance("a", "b"));
    assert!(!manager.add_group_inheritance("b", "a"));
    // Self-inheritance is a one-edge cycle.
    assert!(!manager.add_group_inheritance("a", "a"));

    // The rejected edge left no trace.
    assert!(manager.direct_parent_groups("b").is_empty());
    assert_eq!(manager.all_ancestor_groups("a"), vec!["b".to_string()]);

    // Transitive cycles are caught as well: c -> a -> b, then b -> c.
    assert!(manager.create_group("c", ""));
    assert!(manager.add_group_inheritance("c", "a"));
    assert!(!manager.add_group_inheritance("b", "c"));
    manager.shutdown();
}

#[test]
fn defaults_decide_unmatched_nodes() {
    let manager = test_manager();
    assert!(manager.register_permission("spawn.use", "", true));
    assert!(manager.register_permission("spawn.admin", "", false));

    assert!(manager.has_permission(PLAYER_A, "spawn.use"));
    assert!(!manager.has_permission(PLAYER_A, "spawn.admin"));
    // Unregistered nodes are denied.
    assert!(!manager.has_permission(PLAYER_A, "spawn.unknown"));

    // An explicit denial beats a granting default.
    assert!(manager.create_group("punished", ""));
    assert!(manager.add_permission_to_group("punished", "-spawn.use"));
    assert!(manager.add_player_to_group(PLAYER_A, "punished", None));
    assert!(!manager.has_permission(PLAYER_A, "spawn.use"));
    manager.shutdown();
}

#[test]
fn rule_round_trip() {
    let manager = test_manager();
    assert!(manager.create_group("g", ""));
    assert!(manager.add_permission_to_group("g", "kit.daily"));
    assert!(manager
        .direct_permissions_of_group("g")
        .contains(&"kit.daily".to_string()));

    assert!(manager.remove_permission_from_group("g", "kit.daily"));
    assert!(manager.direct_permissions_of_group("g").is_empty());
    // Removing an association that does not exist reports failure.
    assert!(!manager.remove_permission_from_group("g", "kit.daily"));
    manager.shutdown();
}

#[test]
fn permission_registration_is_idempotent() {
    let manager = test_manager();
    assert!(manager.register_permission("vault.open", "first", true));
    assert!(manager.register_permission("vault.open", "second", true));

    let names = manager.all_permissions();
    assert_eq!(names, vec!["vault.open".to_string()]);
    assert!(manager.has_permission(PLAYER_A, "vault.open"));

    // Re-registration updates the default in place.
    assert!(manager.register_permission("vault.open", "third", false));
    assert!(!manager.has_permission(PLAYER_A, "vault.open"));
    manager.shutdown();
}

#[test]
fn plural_rule_operations_report_counts() {
    let manager = test_manager();
    assert!(manager.create_group("g", ""));
    let rules = vec![
        "warp.home".to_string(),
        "warp.spawn".to_string(),
        "warp.home".to_string(), // duplicate, not counted twice
        String::new(),           // ignored
    ];
    assert_eq!(manager.add_permissions_to_group("g", &rules), 2);

    let mut direct = manager.direct_permissions_of_group("g");
    direct.sort();
    assert_eq!(direct, vec!["warp.home".to_string(), "warp.spawn".to_string()]);

    let removals = vec!["warp.home".to_string(), "warp.none".to_string()];
    assert_eq!(manager.remove_permissions_from_group("g", &removals), 1);
    assert_eq!(manager.add_permissions_to_group("missing", &rules), 0);
    manager.shutdown();
}

#[test]
fn batch_membership_operations() {
    let manager = test_manager();
    assert!(manager.create_group("one", ""));
    assert!(manager.create_group("two", ""));
    let names = vec![
        "one".to_string(),
        "two".to_string(),
        "ghost".to_string(), // unknown groups are skipped
    ];
    assert_eq!(manager.add_player_to_groups(PLAYER_A, &names), 2);

    let mut groups = manager.player_groups(PLAYER_A);
    groups.sort();
    assert_eq!(groups, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(manager.player_group_ids(PLAYER_A).len(), 2);
    assert!(manager.players_in_group("one").contains(&PLAYER_A.to_string()));

    assert_eq!(
        manager.remove_player_from_groups(PLAYER_A, &["one".to_string(), "two".to_string()]),
        2
    );
    assert!(manager.player_groups(PLAYER_A).is_empty());
    manager.shutdown();
}

#[test]
fn deleting_a_group_cascades() {
    let manager = test_manager();
    assert!(manager.create_group("parent", ""));
    assert!(manager.add_permission_to_group("parent", "build"));
    assert!(manager.create_group("child", ""));
    assert!(manager.add_group_inheritance("child", "parent"));
    assert!(manager.add_player_to_group(PLAYER_A, "parent", None));

    assert!(manager.has_permission(PLAYER_A, "build"));
    assert!(manager.delete_group("parent"));

    assert!(!manager.group_exists("parent"));
    assert!(!manager.has_permission(PLAYER_A, "build"));
    assert!(manager.player_groups(PLAYER_A).is_empty());
    assert!(manager.all_ancestor_groups("child").is_empty());
    // Deleting again fails: the group is gone.
    assert!(!manager.delete_group("parent"));
    manager.shutdown();
}

#[test]
fn group_metadata_round_trip() {
    let manager = test_manager();
    assert!(manager.create_group("staff", "the staff"));
    assert_eq!(manager.group_description("staff"), "the staff");
    assert!(manager.update_group_description("staff", "trusted staff"));
    assert_eq!(manager.group_description("staff"), "trusted staff");

    assert_eq!(manager.group_priority("staff"), 0);
    assert!(manager.set_group_priority("staff", 50));
    assert_eq!(manager.group_priority("staff"), 50);

    let details = manager.group_details("staff").unwrap();
    assert_eq!(details.name, "staff");
    assert_eq!(details.priority, 50);
    assert_eq!(details.description, "trusted staff");

    assert!(!manager.update_group_description("nobody", "x"));
    assert!(!manager.set_group_priority("nobody", 1));
    assert!(manager.group_details("nobody").is_none());
    manager.shutdown();
}

#[test]
fn group_effective_rules_include_ancestors() {
    let manager = test_manager();
    assert!(manager.create_group("parent", ""));
    assert!(manager.set_group_priority("parent", 1));
    assert!(manager.add_permission_to_group("parent", "shop.sell"));
    assert!(manager.create_group("child", ""));
    assert!(manager.set_group_priority("child", 2));
    assert!(manager.add_permission_to_group("child", "-shop.sell"));
    assert!(manager.add_group_inheritance("child", "parent"));

    let effective = manager.permissions_of_group("child");
    let sell = effective.iter().find(|rule| rule.pattern == "shop.sell").unwrap();
    // The child's own denial overrides what it inherits.
    assert!(!sell.state);

    let parent_effective = manager.permissions_of_group("parent");
    assert!(parent_effective.iter().any(|rule| rule.pattern == "shop.sell" && rule.state));
    manager.shutdown();
}

#[test]
fn cancelled_before_event_aborts_mutation() {
    let manager = test_manager();
    assert!(manager.create_group("vip", ""));
    assert!(manager.create_group("member", ""));
    manager.events().on_before(|event| {
        !matches!(
            event,
            PermissionEvent::PlayerJoinGroup { group_name, .. } if group_name == "vip"
        )
    });

    assert!(!manager.add_player_to_group(PLAYER_A, "vip", None));
    assert!(manager.player_groups(PLAYER_A).is_empty());

    assert!(manager.add_player_to_group(PLAYER_A, "member", None));
    assert_eq!(manager.player_groups(PLAYER_A), vec!["member".to_string()]);
    manager.shutdown();
}

#[test]
fn after_events_fire_on_success_only() {
    let manager = test_manager();
    let mut rx = manager.events().subscribe();
    assert!(manager.create_group("g", ""));
    assert!(manager.add_permission_to_group("g", "x"));
    assert!(!manager.add_permission_to_group("missing", "x"));

    let event = rx.try_recv().unwrap();
    assert!(matches!(
        event,
        PermissionEvent::GroupPermissionChange { ref group_name, ref rule, added: true }
            if group_name == "g" && rule == "x"
    ));
    // The failed mutation published nothing.
    assert!(rx.try_recv().is_err());
    manager.shutdown();
}

#[test]
fn uninitialized_manager_refuses_everything() {
    let manager = PermissionManager::new();
    assert!(!manager.create_group("g", ""));
    assert!(!manager.has_permission(PLAYER_A, "any.node"));
    assert!(manager.all_groups().is_empty());
    assert!(manager.player_groups(PLAYER_A).is_empty());
    assert_eq!(manager.add_permissions_to_group("g", &["x".to_string()]), 0);
}
