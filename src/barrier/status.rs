/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{protocol::GuestMessage, provisioner::GuestDescriptor};
use itertools::Itertools;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
};

/// Last known state of a guest during an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStatus {
    Unknown,
    Ready,
    Finished,
    Offline,
}

impl GuestStatus {
    fn symbol(&self) -> char {
        match self {
            GuestStatus::Unknown => 'U',
            GuestStatus::Ready => 'R',
            GuestStatus::Finished => 'F',
            GuestStatus::Offline => 'X',
        }
    }
}

impl From<GuestMessage> for GuestStatus {
    fn from(message: GuestMessage) -> Self {
        match message {
            GuestMessage::Ready => GuestStatus::Ready,
            // a guest that uploaded has still only finished its round
            GuestMessage::Finished | GuestMessage::Uploaded => GuestStatus::Finished,
        }
    }
}

/// The guests of one entry, their statuses, and the address registry used to tell who sent
/// a datagram. Built once from the planned descriptors, so identities never change mid-entry.
#[derive(Debug)]
pub struct Pool {
    guests: Vec<(GuestDescriptor, GuestStatus)>,
    by_address: HashMap<IpAddr, u32>,
}

impl Pool {
    pub fn new(descriptors: &[GuestDescriptor]) -> Self {
        let guests = descriptors
            .iter()
            .cloned()
            .sorted_by_key(|guest| guest.slot)
            .map(|guest| (guest, GuestStatus::Unknown))
            .collect_vec();

        let by_address = guests
            .iter()
            .map(|(guest, _)| (guest.address.ip(), guest.slot))
            .collect();

        Self { guests, by_address }
    }

    pub fn size(&self) -> u32 {
        self.guests.len() as u32
    }

    pub fn resolve(&self, sender: SocketAddr) -> Option<u32> {
        self.by_address.get(&sender.ip()).copied()
    }

    pub fn status(&self, slot: u32) -> Option<GuestStatus> {
        self.guests
            .iter()
            .find(|(guest, _)| guest.slot == slot)
            .map(|(_, status)| *status)
    }

    /// Records a reported status. Returns `false` without changing anything when the guest is
    /// offline or already in `status`.
    pub fn record(&mut self, slot: u32, status: GuestStatus) -> bool {
        match self.guests.iter_mut().find(|(guest, _)| guest.slot == slot) {
            Some((_, current)) if *current != GuestStatus::Offline && *current != status => {
                *current = status;
                true
            }
            _ => false,
        }
    }

    pub fn take_offline(&mut self, slot: u32) {
        if let Some((_, status)) = self.guests.iter_mut().find(|(guest, _)| guest.slot == slot) {
            *status = GuestStatus::Offline;
        }
    }

    pub fn online(&self) -> impl Iterator<Item = &GuestDescriptor> {
        self.guests
            .iter()
            .filter(|(_, status)| *status != GuestStatus::Offline)
            .map(|(guest, _)| guest)
    }

    pub fn highest_online(&self) -> Option<&GuestDescriptor> {
        self.online().last()
    }

    pub fn leader_slot(&self) -> Option<u32> {
        self.guests
            .iter()
            .find(|(guest, _)| guest.leader)
            .map(|(guest, _)| guest.slot)
    }

    pub fn leader_name(&self) -> Option<String> {
        self.guests
            .iter()
            .find(|(guest, _)| guest.leader)
            .map(|(guest, _)| guest.name.clone())
    }

    /// True once every online guest is in `status`. Offline guests never block.
    pub fn converged(&self, status: GuestStatus) -> bool {
        self.guests
            .iter()
            .all(|(_, current)| *current == GuestStatus::Offline || *current == status)
    }

    /// Names of the online guests not yet in `status`.
    pub fn unconverged(&self, status: GuestStatus) -> Vec<String> {
        self.guests
            .iter()
            .filter(|(_, current)| *current != GuestStatus::Offline && *current != status)
            .map(|(guest, _)| guest.name.clone())
            .collect()
    }

    /// One letter per guest in slot order, e.g. `[R R F X]`.
    pub fn render(&self) -> String {
        format!(
            "[{}]",
            self.guests
                .iter()
                .map(|(_, status)| status.symbol())
                .join(" ")
        )
    }
}
