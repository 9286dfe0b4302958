#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    helpers::bpf_ktime_get_ns,
    macros::{map, xdp},
    maps::{
        lpm_trie::{Key, LpmTrie},
        Array,
    },
    programs::XdpContext,
};

use core::mem;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use cerberus_common::{
    classify::{classify, Accounting, SteeringTables, Verdict},
    frame::FrameBytes,
    utils::u32_to_octets,
    Action, FilterRule, GlobalStats, RuleStats, HOST_LIST_CAPACITY, MAX_RULES,
};

// LPM trie 必须以无预分配方式创建
const BPF_F_NO_PREALLOC: u32 = 1;

// === eBPF Maps 定义 ===

// 规则表，槽位下标即优先级
#[map]
static FILTER_RULES: Array<FilterRule> = Array::with_max_entries(MAX_RULES, 0);

// 每条规则的命中统计
#[map]
static RULE_STATS: Array<RuleStats> = Array::with_max_entries(MAX_RULES, 0);

// 全局统计，只有一个元素
#[map]
static GLOBAL_STATS: Array<GlobalStats> = Array::with_max_entries(1, 0);

// 源地址白名单
#[map]
static ALLOW_LIST: LpmTrie<[u8; 4], u8> =
    LpmTrie::with_max_entries(HOST_LIST_CAPACITY, BPF_F_NO_PREALLOC);

// 源地址黑名单
#[map]
static DENY_LIST: LpmTrie<[u8; 4], u8> =
    LpmTrie::with_max_entries(HOST_LIST_CAPACITY, BPF_F_NO_PREALLOC);

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[xdp]
pub fn xdp_packet_steering(ctx: XdpContext) -> u32 {
    let decision = classify(&XdpFrame(&ctx), &KernelTables);
    match decision.accounting {
        Accounting::None => {}
        Accounting::Global(action) => record_global(action, decision.len),
        Accounting::Rule { slot, action } => {
            record_rule(slot, decision.len);
            record_global(action, decision.len);
        }
    }
    match decision.verdict {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => xdp_action::XDP_DROP,
    }
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Option<*const T> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return None;
    }

    Some((start + offset) as *const T)
}

struct XdpFrame<'a>(&'a XdpContext);

impl FrameBytes for XdpFrame<'_> {
    #[inline(always)]
    fn len(&self) -> usize {
        self.0.data_end() - self.0.data()
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let ptr: *const [u8; N] = ptr_at(self.0, offset)?;
        Some(unsafe { ptr.read_unaligned() })
    }
}

struct KernelTables;

impl SteeringTables for KernelTables {
    #[inline(always)]
    fn rule(&self, slot: u32) -> Option<FilterRule> {
        FILTER_RULES.get(slot).copied()
    }

    #[inline(always)]
    fn allow_listed(&self, addr: u32) -> bool {
        let key = Key::new(32, u32_to_octets(addr));
        ALLOW_LIST.get(&key).is_some()
    }

    #[inline(always)]
    fn deny_listed(&self, addr: u32) -> bool {
        let key = Key::new(32, u32_to_octets(addr));
        DENY_LIST.get(&key).is_some()
    }
}

#[inline(always)]
unsafe fn atomic_add(counter: *mut u64, value: u64) {
    AtomicU64::from_ptr(counter).fetch_add(value, Ordering::Relaxed);
}

#[inline(always)]
fn record_rule(slot: u32, len: u64) {
    let Some(stats) = RULE_STATS.get_ptr_mut(slot) else {
        return;
    };
    unsafe {
        atomic_add(addr_of_mut!((*stats).packets), 1);
        atomic_add(addr_of_mut!((*stats).bytes), len);
        (*stats).last_hit = bpf_ktime_get_ns();
    }
}

#[inline(always)]
fn record_global(action: Action, len: u64) {
    let Some(stats) = GLOBAL_STATS.get_ptr_mut(0) else {
        return;
    };
    let counters = stats as *mut u64;
    unsafe {
        atomic_add(addr_of_mut!((*stats).total_packets), 1);
        atomic_add(addr_of_mut!((*stats).total_bytes), len);
        atomic_add(counters.add(GlobalStats::counter_index(action)), 1);
    }
}
