use dbt_core::excp::{
    EXCP_FETCH_FAULT, EXCP_ILLEGAL, EXCP_LOAD_FAULT, EXCP_STORE_FAULT,
};
use dbt_core::{Access, Exception, FaultKind, GuestFault, TranslateError, Unwind};

fn fault(access: Access) -> GuestFault {
    GuestFault {
        vaddr: 0x3008,
        access,
        kind: FaultKind::Unmapped,
        pc: 0x100,
    }
}

#[test]
fn fault_maps_to_access_specific_exception() {
    for (access, code) in [
        (Access::Fetch, EXCP_FETCH_FAULT),
        (Access::Load, EXCP_LOAD_FAULT),
        (Access::Store, EXCP_STORE_FAULT),
    ] {
        let e = Exception::from(fault(access));
        assert_eq!(e, Exception::new(code, 0x100, 0x3008));
    }
}

fn helper(fail: bool) -> Result<u64, GuestFault> {
    if fail {
        Err(fault(Access::Load))
    } else {
        Ok(7)
    }
}

fn unit_body(fail: bool) -> Result<u64, Unwind> {
    let v = helper(fail)?;
    Ok(v + 1)
}

#[test]
fn guest_fault_propagates_as_unwind() {
    assert_eq!(unit_body(false), Ok(8));
    assert_eq!(unit_body(true), Err(Unwind::Fault(fault(Access::Load))));
}

#[test]
fn translate_error_wraps_fetch_fault() {
    let e: TranslateError = fault(Access::Fetch).into();
    assert!(matches!(e, TranslateError::Fault(f) if f.access == Access::Fetch));
    let msg = TranslateError::Unsupported {
        pc: 0x40,
        insn: 0xdead_beef,
    }
    .to_string();
    assert_eq!(msg, "unsupported instruction 0xdeadbeef at pc 0x40");
}

#[test]
fn unwind_messages() {
    let u = Unwind::Exception(Exception::new(EXCP_ILLEGAL, 0x8, 0));
    assert!(u.to_string().starts_with("guest exception"));
    assert_eq!(
        Unwind::Exit { pc: 0x20 }.to_string(),
        "loop exit, resume at pc 0x20"
    );
    let f = Unwind::from(fault(Access::Store));
    assert_eq!(
        f.to_string(),
        "Unmapped fault on Store of 0x3008 at pc 0x100"
    );
}
