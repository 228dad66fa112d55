use log::info;

use crate::{
    error::{Result, SppError},
    event::{AttrHandle, AttrKind, CharProp, DbElement},
};

/// Logical position of an attribute inside the serial port service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Service = 0,
    NotifyData = 1,
    ReceiveData = 2,
    NotifyConfig = 3,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::Service,
        Role::NotifyData,
        Role::ReceiveData,
        Role::NotifyConfig,
    ];

    fn accepts(self, kind: AttrKind) -> bool {
        match self {
            Role::Service => kind == AttrKind::PrimaryService,
            Role::NotifyData | Role::ReceiveData => kind == AttrKind::Characteristic,
            Role::NotifyConfig => kind == AttrKind::Descriptor,
        }
    }
}

/// Attribute handles of the serial port service, resolved after discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    elements: [DbElement; 4],
}

impl Catalog {
    pub fn build(elements: Vec<DbElement>) -> Result<Self> {
        let elements: [DbElement; 4] =
            elements
                .try_into()
                .map_err(|e: Vec<DbElement>| SppError::DiscoveryMismatch {
                    expected: Role::ALL.len(),
                    found: e.len(),
                })?;

        for role in Role::ALL {
            let elem = &elements[role as usize];
            if !role.accepts(elem.kind) {
                return Err(SppError::UnexpectedAttribute {
                    role,
                    kind: elem.kind,
                    handle: elem.handle,
                });
            }
        }

        Ok(Catalog { elements })
    }

    pub fn element(&self, role: Role) -> &DbElement {
        &self.elements[role as usize]
    }

    pub fn handle(&self, role: Role) -> AttrHandle {
        self.element(role).handle
    }

    pub fn role_of(&self, handle: AttrHandle) -> Option<Role> {
        Role::ALL.into_iter().find(|r| self.handle(*r) == handle)
    }

    /// The configuration descriptor enabling delivery for the characteristic
    /// at `handle`. Only the notify characteristic has one.
    pub fn config_descriptor_for(&self, handle: AttrHandle) -> Option<AttrHandle> {
        match self.role_of(handle)? {
            Role::NotifyData => Some(self.handle(Role::NotifyConfig)),
            _ => None,
        }
    }

    pub fn is_writable(&self, role: Role) -> bool {
        self.element(role)
            .properties
            .intersects(CharProp::Write | CharProp::WriteNoRsp)
    }

    pub fn log(&self) {
        for e in self.elements.iter() {
            info!(
                "{:?}, attribute handle {}, uuid 0x{:04x}, properties {:?}",
                e.kind, e.handle, e.uuid, e.properties
            );
        }
    }
}
